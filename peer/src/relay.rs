//! Hand-off between the follower loop and whatever decides the player's moves.
//!
//! The follower talks to its decision process through two single-slot queues:
//! events go out, decisions come back. The decider is either the built-in
//! [`crate::ai::ScriptedAi`] or an external game engine reached over TCP by
//! [`EngineRelay`], which speaks newline-terminated JSON.

use log::{debug, info, warn};
use shared::wire::{self, Message};
use shared::{Direction, GameStart, Pid, Round, SessionError, Snapshot};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Something the decider needs to know about.
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionEvent {
    GameStart { round: Round, game_start: GameStart },
    RoundStart { round: Round },
    Moves { round: Round, moves: Vec<Snapshot> },
    GameOver { round: Round, finish: Vec<Pid> },
}

impl DecisionEvent {
    pub fn to_message(&self) -> Message {
        match self {
            DecisionEvent::GameStart { round, game_start } => Message::GameStart {
                round: *round,
                game_start: game_start.clone(),
            },
            DecisionEvent::RoundStart { round } => Message::RoundStart { round: *round },
            DecisionEvent::Moves { round, moves } => Message::Moves {
                round: *round,
                moves: moves.clone(),
            },
            DecisionEvent::GameOver { round, finish } => Message::GameOver {
                round: *round,
                pids_in_order_of_death: finish.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The leader-elect's player wants the lobby closed.
    Start,
    Move(Direction),
    /// The decider saw its player crash.
    Died,
}

/// Follower side of the queues.
pub struct Decider {
    events: mpsc::Sender<DecisionEvent>,
    decisions: mpsc::Receiver<Decision>,
}

impl Decider {
    pub async fn notify(&self, event: DecisionEvent) -> Result<(), SessionError> {
        self.events
            .send(event)
            .await
            .map_err(|_| SessionError::DeciderClosed)
    }

    pub async fn next_decision(&mut self) -> Result<Decision, SessionError> {
        self.decisions
            .recv()
            .await
            .ok_or(SessionError::DeciderClosed)
    }
}

/// Decider side of the queues.
pub struct DecisionPort {
    pub events: mpsc::Receiver<DecisionEvent>,
    pub decisions: mpsc::Sender<Decision>,
}

impl DecisionPort {
    pub async fn decide(&self, decision: Decision) -> Result<(), SessionError> {
        self.decisions
            .send(decision)
            .await
            .map_err(|_| SessionError::DeciderClosed)
    }
}

pub fn decision_channels() -> (Decider, DecisionPort) {
    let (event_tx, event_rx) = mpsc::channel(1);
    let (decision_tx, decision_rx) = mpsc::channel(1);

    (
        Decider {
            events: event_tx,
            decisions: decision_rx,
        },
        DecisionPort {
            events: event_rx,
            decisions: decision_tx,
        },
    )
}

/// Line-protocol bridge to an external game engine.
pub struct EngineRelay<R, W> {
    reader: R,
    writer: W,
    min_game_speed: Duration,
    is_leader: bool,
}

impl EngineRelay<BufReader<OwnedReadHalf>, OwnedWriteHalf> {
    /// Dials the engine listening on `localhost:<port>`.
    pub async fn connect(
        port: u16,
        min_game_speed: Duration,
        is_leader: bool,
    ) -> Result<Self, SessionError> {
        info!(target: "relay", "Connecting to the decision process on port {}", port);
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self::new(
            BufReader::new(read_half),
            write_half,
            min_game_speed,
            is_leader,
        ))
    }
}

impl<R, W> EngineRelay<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, min_game_speed: Duration, is_leader: bool) -> Self {
        Self {
            reader,
            writer,
            min_game_speed,
            is_leader,
        }
    }

    pub async fn run(mut self, mut port: DecisionPort) -> Result<(), SessionError> {
        if self.is_leader {
            self.await_start().await?;
            port.decide(Decision::Start).await?;
        }

        while let Some(event) = port.events.recv().await {
            self.write_message(&event.to_message()).await?;

            match event {
                DecisionEvent::RoundStart { round } => {
                    tokio::time::sleep(self.min_game_speed).await;
                    let decision = self.read_decision().await?;
                    debug!(target: "relay", "Round {} decision: {:?}", round, decision);
                    port.decide(decision).await?;
                }
                DecisionEvent::GameOver { .. } => {
                    info!(target: "relay", "Game over forwarded, closing the relay");
                    break;
                }
                _ => {}
            }
        }

        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, SessionError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(SessionError::DeciderClosed);
        }
        Ok(line)
    }

    async fn await_start(&mut self) -> Result<(), SessionError> {
        loop {
            let line = self.read_line().await?;
            match wire::decode(line.as_bytes()) {
                Ok(Message::Start) => {
                    info!(target: "relay", "Decision process asked to start the game");
                    return Ok(());
                }
                _ => warn!(target: "relay", "Expected START, got `{}`", line.trim()),
            }
        }
    }

    async fn read_decision(&mut self) -> Result<Decision, SessionError> {
        loop {
            let line = self.read_line().await?;
            match wire::decode(line.as_bytes()) {
                Ok(Message::MyMove { direction, .. }) => return Ok(Decision::Move(direction)),
                Ok(Message::Death { .. }) => return Ok(Decision::Died),
                Ok(other) => {
                    warn!(target: "relay", "Unexpected {} from the decision process", other.kind().as_str());
                }
                Err(e) => warn!(target: "relay", "Unreadable reply `{}`: {}", line.trim(), e),
            }
        }
    }

    async fn write_message(&mut self, message: &Message) -> Result<(), SessionError> {
        let mut line = wire::encode(message)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn line(message: &Message) -> Vec<u8> {
        let mut bytes = wire::encode(message).unwrap();
        bytes.push(b'\n');
        bytes
    }

    #[tokio::test]
    async fn test_round_start_waits_for_move() {
        let round_start = Message::RoundStart { round: 4 };
        let reader = Builder::new()
            .read(br#"{"eventName":"myMove","direction":"RIGHT","pid":"1","round":4}"#)
            .read(b"\n")
            .build();
        let writer = Builder::new().write(&line(&round_start)).build();

        let relay = EngineRelay::new(BufReader::new(reader), writer, Duration::ZERO, false);
        let (mut decider, port) = decision_channels();
        let task = tokio::spawn(relay.run(port));

        decider
            .notify(DecisionEvent::RoundStart { round: 4 })
            .await
            .unwrap();
        assert_eq!(
            decider.next_decision().await.unwrap(),
            Decision::Move(Direction::Right)
        );

        drop(decider);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_death_reply() {
        let round_start = Message::RoundStart { round: 2 };
        let reader = Builder::new()
            .read(b"{\"eventName\":\"death\",\"pid\":\"3\",\"round\":2}\n")
            .build();
        let writer = Builder::new().write(&line(&round_start)).build();

        let relay = EngineRelay::new(BufReader::new(reader), writer, Duration::ZERO, false);
        let (mut decider, port) = decision_channels();
        let task = tokio::spawn(relay.run(port));

        decider
            .notify(DecisionEvent::RoundStart { round: 2 })
            .await
            .unwrap();
        assert_eq!(decider.next_decision().await.unwrap(), Decision::Died);

        drop(decider);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_leader_reads_start_first() {
        let game_over = Message::GameOver {
            round: 9,
            pids_in_order_of_death: vec![Pid(2), Pid(1)],
        };
        let reader = Builder::new().read(b"START\n").build();
        let writer = Builder::new().write(&line(&game_over)).build();

        let relay = EngineRelay::new(BufReader::new(reader), writer, Duration::ZERO, true);
        let (mut decider, port) = decision_channels();
        let task = tokio::spawn(relay.run(port));

        assert_eq!(decider.next_decision().await.unwrap(), Decision::Start);
        decider
            .notify(DecisionEvent::GameOver {
                round: 9,
                finish: vec![Pid(2), Pid(1)],
            })
            .await
            .unwrap();

        // The relay stops on its own after forwarding gameOver
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_engine_hang_up() {
        let round_start = Message::RoundStart { round: 2 };
        let reader = Builder::new().build();
        let writer = Builder::new().write(&line(&round_start)).build();

        let relay = EngineRelay::new(BufReader::new(reader), writer, Duration::ZERO, false);
        let (decider, port) = decision_channels();
        let task = tokio::spawn(relay.run(port));

        decider
            .notify(DecisionEvent::RoundStart { round: 2 })
            .await
            .unwrap();
        assert!(matches!(
            task.await.unwrap(),
            Err(SessionError::DeciderClosed)
        ));
    }

    #[tokio::test]
    async fn test_decider_closed() {
        let (mut decider, port) = decision_channels();
        drop(port);
        assert!(matches!(
            decider.next_decision().await,
            Err(SessionError::DeciderClosed)
        ));
        assert!(matches!(
            decider.notify(DecisionEvent::RoundStart { round: 1 }).await,
            Err(SessionError::DeciderClosed)
        ));
    }
}
