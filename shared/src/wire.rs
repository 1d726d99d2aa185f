//! JSON wire format spoken between peers and with the decision process.
//!
//! Every in-game message is a flat JSON object with a `messageType`, an
//! `eventName` and a `round`, plus one variant-specific payload. The decision
//! process only ever fills `eventName`, so decoding falls back to it. Two
//! lobby control messages are bare strings: `JOIN:<nickname>` and `START`.

use crate::{Direction, Epoch, Pid, Position, Round, Snapshot, WireError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const JOIN_PREFIX: &str = "JOIN:";
pub const START: &str = "START";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    RoundStart,
    MyMove,
    Moves,
    GameStart,
    GameOver,
    KillPlayer,
    CheckLeader,
    NewLeader,
    LeaderAlive,
    LeaderDead,
    Death,
    Join,
    Start,
}

impl MessageKind {
    /// Value of the `messageType` field.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::RoundStart => "roundstart",
            MessageKind::MyMove => "myMove",
            MessageKind::Moves => "moves",
            MessageKind::GameStart => "startgame",
            MessageKind::GameOver => "gameOver",
            MessageKind::KillPlayer => "killplayer",
            MessageKind::CheckLeader => "checkleader",
            MessageKind::NewLeader => "newleader",
            MessageKind::LeaderAlive => "leaderalive",
            MessageKind::LeaderDead => "leaderdead",
            MessageKind::Death => "death",
            MessageKind::Join => "JOIN",
            MessageKind::Start => START,
        }
    }

    /// Value of the `eventName` field, which is what the decision process reads.
    pub fn event_name(self) -> &'static str {
        match self {
            MessageKind::RoundStart => "roundStart",
            MessageKind::GameStart => "gameStart",
            other => other.as_str(),
        }
    }

    /// Accepts both the `messageType` and the `eventName` spelling.
    pub fn parse(tag: &str) -> Option<Self> {
        let kind = match tag {
            "roundstart" | "roundStart" => MessageKind::RoundStart,
            "myMove" => MessageKind::MyMove,
            "moves" => MessageKind::Moves,
            "startgame" | "gameStart" => MessageKind::GameStart,
            "gameOver" => MessageKind::GameOver,
            "killplayer" => MessageKind::KillPlayer,
            "checkleader" => MessageKind::CheckLeader,
            "newleader" => MessageKind::NewLeader,
            "leaderalive" => MessageKind::LeaderAlive,
            "leaderdead" => MessageKind::LeaderDead,
            "death" => MessageKind::Death,
            _ => return None,
        };
        Some(kind)
    }
}

/// Per-player session setup, sent once to each address when the lobby closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStart {
    /// The recipient's own pid.
    pub pid: Pid,
    pub starting_positions: BTreeMap<Pid, Position>,
    pub nicknames: BTreeMap<Pid, String>,
    /// `"ip:port"` of every player's follower socket.
    pub addresses: BTreeMap<String, Pid>,
}

/// Round and epoch carried by all four election messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ballot {
    pub round: Round,
    pub leader_id: Epoch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    RoundStart {
        round: Round,
    },
    MyMove {
        round: Round,
        pid: Pid,
        direction: Direction,
    },
    /// The consensus position window, oldest snapshot first.
    Moves {
        round: Round,
        moves: Vec<Snapshot>,
    },
    GameStart {
        round: Round,
        game_start: GameStart,
    },
    GameOver {
        round: Round,
        pids_in_order_of_death: Vec<Pid>,
    },
    KillPlayer {
        round: Round,
        pid: Pid,
    },
    CheckLeader(Ballot),
    NewLeader(Ballot),
    LeaderAlive(Ballot),
    LeaderDead(Ballot),
    /// Sent by the decision process when its player crashed.
    Death {
        round: Round,
        pid: Pid,
    },
    Join {
        nickname: String,
    },
    Start,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::RoundStart { .. } => MessageKind::RoundStart,
            Message::MyMove { .. } => MessageKind::MyMove,
            Message::Moves { .. } => MessageKind::Moves,
            Message::GameStart { .. } => MessageKind::GameStart,
            Message::GameOver { .. } => MessageKind::GameOver,
            Message::KillPlayer { .. } => MessageKind::KillPlayer,
            Message::CheckLeader(_) => MessageKind::CheckLeader,
            Message::NewLeader(_) => MessageKind::NewLeader,
            Message::LeaderAlive(_) => MessageKind::LeaderAlive,
            Message::LeaderDead(_) => MessageKind::LeaderDead,
            Message::Death { .. } => MessageKind::Death,
            Message::Join { .. } => MessageKind::Join,
            Message::Start => MessageKind::Start,
        }
    }

    /// Round stamp; `None` for the bare lobby strings.
    pub fn round(&self) -> Option<Round> {
        match self {
            Message::RoundStart { round }
            | Message::MyMove { round, .. }
            | Message::Moves { round, .. }
            | Message::GameStart { round, .. }
            | Message::GameOver { round, .. }
            | Message::KillPlayer { round, .. }
            | Message::Death { round, .. } => Some(*round),
            Message::CheckLeader(ballot)
            | Message::NewLeader(ballot)
            | Message::LeaderAlive(ballot)
            | Message::LeaderDead(ballot) => Some(ballot.round),
            Message::Join { .. } | Message::Start => None,
        }
    }

    pub fn ballot(&self) -> Option<Ballot> {
        match self {
            Message::CheckLeader(ballot)
            | Message::NewLeader(ballot)
            | Message::LeaderAlive(ballot)
            | Message::LeaderDead(ballot) => Some(*ballot),
            _ => None,
        }
    }

    pub fn leader_id(&self) -> Option<Epoch> {
        self.ballot().map(|ballot| ballot.leader_id)
    }

    /// The player a message is about.
    pub fn player_pid(&self) -> Option<Pid> {
        match self {
            Message::MyMove { pid, .. }
            | Message::KillPlayer { pid, .. }
            | Message::Death { pid, .. } => Some(*pid),
            Message::GameStart { game_start, .. } => Some(game_start.pid),
            _ => None,
        }
    }

    pub fn moves(&self) -> Option<&[Snapshot]> {
        match self {
            Message::Moves { moves, .. } => Some(moves),
            _ => None,
        }
    }

    pub fn is_election(&self) -> bool {
        self.ballot().is_some()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<B> {
    #[serde(default)]
    message_type: String,
    #[serde(default)]
    event_name: String,
    #[serde(default)]
    round: Round,
    #[serde(flatten)]
    body: B,
}

#[derive(Serialize, Deserialize)]
struct RoundNumber {
    round: Round,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoundStartBody {
    round_start: RoundNumber,
}

#[derive(Serialize, Deserialize)]
struct MoveBody {
    pid: Pid,
    direction: Direction,
}

#[derive(Serialize, Deserialize)]
struct MovesPayload {
    moves: Vec<Snapshot>,
    round: Round,
}

#[derive(Serialize, Deserialize)]
struct MovesBody {
    moves: MovesPayload,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GameStartBody {
    game_start: GameStart,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GameOverPayload {
    pids_in_order_of_death: Vec<Pid>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GameOverBody {
    game_over: GameOverPayload,
}

#[derive(Serialize, Deserialize)]
struct KillBody {
    playerpid: Pid,
}

#[derive(Serialize, Deserialize)]
struct LeaderBody {
    leaderid: Epoch,
}

#[derive(Serialize, Deserialize)]
struct DeathBody {
    pid: Pid,
}

fn seal<B: Serialize>(kind: MessageKind, round: Round, body: B) -> Result<Vec<u8>, WireError> {
    let envelope = Envelope {
        message_type: kind.as_str().to_string(),
        event_name: kind.event_name().to_string(),
        round,
        body,
    };
    serde_json::to_vec(&envelope).map_err(WireError::Encode)
}

pub fn encode(message: &Message) -> Result<Vec<u8>, WireError> {
    let kind = message.kind();
    match message {
        Message::Join { nickname } => Ok(format!("{}{}", JOIN_PREFIX, nickname).into_bytes()),
        Message::Start => Ok(START.as_bytes().to_vec()),
        Message::RoundStart { round } => seal(
            kind,
            *round,
            RoundStartBody {
                round_start: RoundNumber { round: *round },
            },
        ),
        Message::MyMove {
            round,
            pid,
            direction,
        } => seal(
            kind,
            *round,
            MoveBody {
                pid: *pid,
                direction: *direction,
            },
        ),
        Message::Moves { round, moves } => seal(
            kind,
            *round,
            MovesBody {
                moves: MovesPayload {
                    moves: moves.clone(),
                    round: *round,
                },
            },
        ),
        Message::GameStart { round, game_start } => seal(
            kind,
            *round,
            GameStartBody {
                game_start: game_start.clone(),
            },
        ),
        Message::GameOver {
            round,
            pids_in_order_of_death,
        } => seal(
            kind,
            *round,
            GameOverBody {
                game_over: GameOverPayload {
                    pids_in_order_of_death: pids_in_order_of_death.clone(),
                },
            },
        ),
        Message::KillPlayer { round, pid } => seal(kind, *round, KillBody { playerpid: *pid }),
        Message::CheckLeader(ballot)
        | Message::NewLeader(ballot)
        | Message::LeaderAlive(ballot)
        | Message::LeaderDead(ballot) => seal(
            kind,
            ballot.round,
            LeaderBody {
                leaderid: ballot.leader_id,
            },
        ),
        Message::Death { round, pid } => seal(kind, *round, DeathBody { pid: *pid }),
    }
}

fn discriminator(value: &Value) -> Option<&str> {
    let field = |name: &str| {
        value
            .get(name)
            .and_then(Value::as_str)
            .filter(|tag| !tag.is_empty())
    };
    field("messageType").or_else(|| field("eventName"))
}

fn open<B: DeserializeOwned>(value: Value) -> Result<(Round, B), WireError> {
    let envelope: Envelope<B> = serde_json::from_value(value)?;
    Ok((envelope.round, envelope.body))
}

fn open_ballot(value: Value) -> Result<Ballot, WireError> {
    let (round, body) = open::<LeaderBody>(value)?;
    Ok(Ballot {
        round,
        leader_id: body.leaderid,
    })
}

pub fn decode(bytes: &[u8]) -> Result<Message, WireError> {
    let text = std::str::from_utf8(bytes)?.trim();

    if text == START {
        return Ok(Message::Start);
    }
    if let Some(nickname) = text.strip_prefix(JOIN_PREFIX) {
        return Ok(Message::Join {
            nickname: nickname.trim().to_string(),
        });
    }

    let value: Value = serde_json::from_str(text)?;
    let tag = discriminator(&value).ok_or(WireError::MissingKind)?;
    let kind = MessageKind::parse(tag).ok_or_else(|| WireError::UnknownKind(tag.to_string()))?;

    let message = match kind {
        MessageKind::RoundStart => {
            let (round, body) = open::<RoundStartBody>(value)?;
            Message::RoundStart {
                round: round.max(body.round_start.round),
            }
        }
        MessageKind::MyMove => {
            let (round, body) = open::<MoveBody>(value)?;
            Message::MyMove {
                round,
                pid: body.pid,
                direction: body.direction,
            }
        }
        MessageKind::Moves => {
            let (round, body) = open::<MovesBody>(value)?;
            Message::Moves {
                round,
                moves: body.moves.moves,
            }
        }
        MessageKind::GameStart => {
            let (round, body) = open::<GameStartBody>(value)?;
            Message::GameStart {
                round,
                game_start: body.game_start,
            }
        }
        MessageKind::GameOver => {
            let (round, body) = open::<GameOverBody>(value)?;
            Message::GameOver {
                round,
                pids_in_order_of_death: body.game_over.pids_in_order_of_death,
            }
        }
        MessageKind::KillPlayer => {
            let (round, body) = open::<KillBody>(value)?;
            Message::KillPlayer {
                round,
                pid: body.playerpid,
            }
        }
        MessageKind::CheckLeader => Message::CheckLeader(open_ballot(value)?),
        MessageKind::NewLeader => Message::NewLeader(open_ballot(value)?),
        MessageKind::LeaderAlive => Message::LeaderAlive(open_ballot(value)?),
        MessageKind::LeaderDead => Message::LeaderDead(open_ballot(value)?),
        MessageKind::Death => {
            let (round, body) = open::<DeathBody>(value)?;
            Message::Death {
                round,
                pid: body.pid,
            }
        }
        MessageKind::Join | MessageKind::Start => {
            return Err(WireError::UnknownKind(kind.as_str().to_string()))
        }
    };

    Ok(message)
}
