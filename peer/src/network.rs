//! Follower loop: joins the session, answers rounds, watches the leader and
//! takes over through an election when it goes quiet.

use crate::election::{judge_check, ActiveElection, ElectionOutcome, ElectionState, Promise, Vote, Voter};
use crate::relay::{Decider, Decision, DecisionEvent};
use leader::game::Handoff;
use leader::membership::Membership;
use leader::network::Coordinator;
use log::{debug, error, info, warn};
use shared::net::{recv_until, send_message, MAX_DATAGRAM};
use shared::wire::{self, Ballot, Message};
use shared::{
    Direction, Epoch, Grid, Pid, PositionHistory, Round, RoundMetrics, SessionConfig,
    SessionError, Snapshot,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Where and as whom a follower joins.
#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub bind_ip: IpAddr,
    pub leader_addr: SocketAddr,
    /// This process started the session's first coordinator.
    pub is_leader: bool,
    pub nickname: String,
    pub width: i32,
    pub height: i32,
}

/// Snapshot of a follower's view, published after every change.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowerStatus {
    pub pid: Pid,
    pub round: Round,
    pub epoch: Epoch,
    pub leader: SocketAddr,
    pub is_leader: bool,
    pub election: ElectionState,
}

/// Runs a coordinator to completion on its own task, logging how it ended.
pub fn spawn_coordinator(mut coordinator: Coordinator, from_lobby: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = if from_lobby {
            match coordinator.run_lobby().await {
                Ok(()) => coordinator.run_rounds().await,
                Err(e) => Err(e),
            }
        } else {
            coordinator.run_rounds().await
        };

        match result {
            Ok(finish) => info!(target: "leader", "Game finished, order of death {:?}", finish),
            Err(e) => error!(target: "leader", "Coordinator stopped: {}", e),
        }
    })
}

pub struct Follower {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    options: PeerOptions,
    config: SessionConfig,
    decider: Decider,

    pid: Pid,
    round: Round,
    epoch: Epoch,
    leader: SocketAddr,
    is_leader: bool,
    last_direction: Direction,

    // Mirror of the leader's state, used for the decider and for takeover
    history: PositionHistory,
    grid: Grid,
    roster: Membership,

    state: ElectionState,
    election: Option<ActiveElection>,
    promised: Option<Promise>,
    coordinator: Option<JoinHandle<()>>,

    status: watch::Sender<FollowerStatus>,
    metrics: RoundMetrics,
}

impl Follower {
    /// Binds a socket, joins the leader's lobby and waits for `gameStart`.
    ///
    /// The leader-elect first waits for the decision process to ask for the
    /// game to start and forwards `START`. The join is resent after every
    /// quiet window (lobby timeout plus one response time), up to
    /// `max_missed_messages` times.
    pub async fn join(
        options: PeerOptions,
        config: SessionConfig,
        mut decider: Decider,
    ) -> Result<Self, SessionError> {
        let socket = UdpSocket::bind((options.bind_ip, 0)).await?;
        let local_addr = socket.local_addr()?;
        let leader = options.leader_addr;
        let join = Message::Join {
            nickname: options.nickname.clone(),
        };
        info!(target: "client", "Joining {} as {} from {}", leader, options.nickname, local_addr);

        let mut metrics = RoundMetrics::new(config.metrics);
        metrics.record_written(send_message(&socket, &join, leader).await?);

        if options.is_leader {
            loop {
                match decider.next_decision().await? {
                    Decision::Start => break,
                    other => debug!(target: "client", "Ignoring {:?} before the game", other),
                }
            }
            info!(target: "client", "Starting the game");
            metrics.record_written(send_message(&socket, &Message::Start, leader).await?);
        }

        let mut buffer = vec![0u8; MAX_DATAGRAM];
        let mut silent_windows = 0;
        let (round, game_start) = loop {
            let deadline = Instant::now() + config.lobby_timeout + config.follower_response_time;
            let Some((len, from)) = recv_until(&socket, &mut buffer, deadline).await? else {
                silent_windows += 1;
                if silent_windows >= config.max_missed_messages {
                    return Err(SessionError::LeaderUnreachable(leader));
                }
                warn!(target: "client", "No gameStart yet, joining {} again", leader);
                metrics.record_written(send_message(&socket, &join, leader).await?);
                if options.is_leader {
                    send_message(&socket, &Message::Start, leader).await?;
                }
                continue;
            };
            metrics.record_read(len);

            match wire::decode(&buffer[..len]) {
                Ok(Message::GameStart { round, game_start }) if from == leader => {
                    break (round, game_start)
                }
                Ok(other) => {
                    debug!(target: "client", "Ignoring {} from {} before the game", other.kind().as_str(), from)
                }
                Err(e) => warn!(target: "client", "Discarding malformed datagram from {}: {}", from, e),
            }
        };

        let roster = Membership::from_roster(
            &game_start.addresses,
            &game_start.nicknames,
            config.max_missed_messages,
        )?;
        let mut history = PositionHistory::new(config.history_depth())?;
        let mut grid = Grid::new(options.width, options.height);
        for (pid, position) in &game_start.starting_positions {
            grid.occupy(position, *pid);
            history.current_mut().insert(*pid, *position);
        }
        let last_direction = game_start
            .starting_positions
            .get(&game_start.pid)
            .map_or(Direction::Up, |position| position.direction);

        info!(
            target: "client",
            "Game started: we are player {} of {}",
            game_start.pid,
            roster.len()
        );

        let status = FollowerStatus {
            pid: game_start.pid,
            round,
            epoch: 0,
            leader,
            is_leader: options.is_leader,
            election: ElectionState::Normal,
        };
        let (status, _) = watch::channel(status);

        let follower = Self {
            socket: Arc::new(socket),
            local_addr,
            pid: game_start.pid,
            round,
            epoch: 0,
            leader,
            is_leader: options.is_leader,
            last_direction,
            history,
            grid,
            roster,
            state: ElectionState::Normal,
            election: None,
            promised: None,
            coordinator: None,
            status,
            metrics,
            options,
            config,
            decider,
        };

        follower
            .decider
            .notify(DecisionEvent::GameStart { round, game_start })
            .await?;
        Ok(follower)
    }

    /// Lets the follower know about the coordinator running in this process.
    pub fn attach_coordinator(&mut self, handle: JoinHandle<()>) {
        self.coordinator = Some(handle);
    }

    pub fn subscribe(&self) -> watch::Receiver<FollowerStatus> {
        self.status.subscribe()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Mirror of the leader's position window.
    pub fn history(&self) -> &PositionHistory {
        &self.history
    }

    fn publish(&self) {
        self.status.send_replace(FollowerStatus {
            pid: self.pid,
            round: self.round,
            epoch: self.epoch,
            leader: self.leader,
            is_leader: self.is_leader,
            election: self.state,
        });
    }

    /// Runs until the leader declares the game over; returns the finish order.
    pub async fn run(mut self) -> Result<Vec<Pid>, SessionError> {
        let mut buffer = vec![0u8; MAX_DATAGRAM];

        loop {
            let deadline = Instant::now() + self.config.follower_response_time;

            tokio::select! {
                outcome = election_outcome(&mut self.election) => {
                    let ballot = self.election.take().map(|active| active.ballot);
                    if let Some(ballot) = ballot {
                        self.conclude_election(ballot, outcome).await?;
                    }
                }
                received = recv_until(&self.socket, &mut buffer, deadline) => {
                    match received? {
                        None => self.suspect_leader(),
                        Some((len, from)) => {
                            self.metrics.record_read(len);
                            if let Some(finish) = self.handle_datagram(&buffer[..len], from).await? {
                                return Ok(finish);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_datagram(
        &mut self,
        bytes: &[u8],
        from: SocketAddr,
    ) -> Result<Option<Vec<Pid>>, SessionError> {
        let message = match wire::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(target: "client", "Discarding malformed datagram from {}: {}", from, e);
                return Ok(None);
            }
        };

        if from != self.leader && !message.is_election() {
            debug!(target: "client", "Ignoring {} from {}, not our leader", message.kind().as_str(), from);
            return Ok(None);
        }

        match message {
            Message::RoundStart { round } if round > self.round => self.answer_round(round).await?,
            Message::Moves { round, moves } if round == self.round => {
                self.mirror(&moves);
                self.decider
                    .notify(DecisionEvent::Moves { round, moves })
                    .await?;
            }
            Message::KillPlayer { round, pid } if round >= self.round => {
                if self.roster.kill(pid) && pid == self.pid {
                    info!(target: "client", "We crashed in round {}", round);
                }
            }
            Message::GameOver {
                round,
                pids_in_order_of_death,
            } => {
                info!(target: "client", "Game over, order of death {:?}", pids_in_order_of_death);
                self.metrics.report("follower");
                self.decider
                    .notify(DecisionEvent::GameOver {
                        round,
                        finish: pids_in_order_of_death.clone(),
                    })
                    .await?;
                return Ok(Some(pids_in_order_of_death));
            }
            Message::NewLeader(ballot) if ballot.leader_id > self.epoch => {
                self.adopt_leader(from, ballot);
            }
            Message::CheckLeader(claim) => self.answer_check(claim, from).await?,
            Message::LeaderAlive(_) | Message::LeaderDead(_) => match &self.election {
                Some(active) if active.ballot.leader_id == self.epoch => active.record(message),
                _ => debug!(target: "election", "Late {} from {}", message.kind().as_str(), from),
            },
            other => {
                debug!(
                    target: "client",
                    "Dropping {} for round {:?} at round {}",
                    other.kind().as_str(),
                    other.round(),
                    self.round
                );
            }
        }

        Ok(None)
    }

    async fn answer_round(&mut self, round: Round) -> Result<(), SessionError> {
        self.round = round;
        self.metrics.round_started(round, self.epoch);
        self.publish();

        self.decider
            .notify(DecisionEvent::RoundStart { round })
            .await?;

        let direction = match self.decider.next_decision().await? {
            Decision::Move(direction) => direction,
            Decision::Died => self
                .history
                .latest(self.pid)
                .map_or(self.last_direction, |position| position.direction),
            Decision::Start => self.last_direction,
        };
        self.last_direction = direction;

        let reply = Message::MyMove {
            round,
            pid: self.pid,
            direction,
        };
        let written = send_message(&self.socket, &reply, self.leader).await?;
        self.metrics.record_written(written);
        Ok(())
    }

    fn mirror(&mut self, moves: &[Snapshot]) {
        self.history.replace_window(moves.to_vec());
        for snapshot in moves {
            for (pid, position) in snapshot {
                self.grid.occupy(position, *pid);
            }
        }
    }

    fn adopt_leader(&mut self, from: SocketAddr, ballot: Ballot) {
        info!(
            target: "election",
            "Following new leader {} with epoch {}",
            from,
            ballot.leader_id
        );
        self.leader = from;
        self.epoch = ballot.leader_id;
        self.round = self.round.min(ballot.round);
        if let Some(handle) = self.coordinator.take() {
            warn!(target: "election", "Stopping our coordinator, epoch {} supersedes it", ballot.leader_id);
            handle.abort();
        }
        self.is_leader = false;
        // Dropping the handle abandons our own tally
        self.election = None;
        self.state = ElectionState::Normal;
        self.publish();
    }

    async fn answer_check(&mut self, claim: Ballot, from: SocketAddr) -> Result<(), SessionError> {
        let Some(sender) = self.roster.pid_for(from) else {
            debug!(target: "election", "checkleader from unknown address {}", from);
            return Ok(());
        };

        let now = Instant::now();
        let voter = Voter {
            pid: self.pid,
            round: self.round,
            epoch: self.epoch,
            state: self.state,
            promised: self.promised,
            window: self.config.follower_response_time,
        };
        let vote = judge_check(&voter, claim, sender, now);
        debug!(target: "election", "Player {} asks for epoch {}: {:?}", sender, claim.leader_id, vote);

        match vote {
            Vote::Yield => {
                info!(target: "election", "Yielding to player {}", sender);
                self.election = None;
                self.state = ElectionState::Normal;
                self.promise(claim.leader_id, sender, now);
                self.publish();
            }
            Vote::Promise => self.promise(claim.leader_id, sender, now),
            Vote::Alive | Vote::SelfVote => {}
        }

        let reply = vote.reply(Ballot {
            round: self.round,
            leader_id: self.epoch,
        });
        let written = send_message(&self.socket, &reply, from).await?;
        self.metrics.record_written(written);
        Ok(())
    }

    fn promise(&mut self, epoch: Epoch, candidate: Pid, at: Instant) {
        self.promised = Some(Promise {
            epoch,
            candidate,
            at,
        });
    }

    fn suspect_leader(&mut self) {
        if self.election.is_some() {
            return;
        }
        if let Some(handle) = &self.coordinator {
            if !handle.is_finished() {
                debug!(target: "client", "Quiet round, but our coordinator is still running");
                return;
            }
        }

        warn!(
            target: "election",
            "No word from leader {} at round {}, calling an election",
            self.leader,
            self.round
        );
        let ballot = Ballot {
            round: self.round,
            leader_id: self.epoch,
        };
        self.state = ElectionState::Quorum;
        self.election = Some(ActiveElection::start(
            Arc::clone(&self.socket),
            ballot,
            self.roster.addresses(),
            self.config.follower_response_time,
        ));
        self.publish();
    }

    async fn conclude_election(
        &mut self,
        ballot: Ballot,
        outcome: ElectionOutcome,
    ) -> Result<(), SessionError> {
        info!(target: "election", "Election for epoch {} ended: {:?}", ballot.leader_id, outcome);

        if outcome == ElectionOutcome::Won
            && ballot.leader_id == self.epoch
            && self.state == ElectionState::Quorum
        {
            self.promote().await?;
        } else {
            self.state = ElectionState::Normal;
            self.publish();
        }
        Ok(())
    }

    /// Stands up a coordinator from the mirrored state and follows it.
    async fn promote(&mut self) -> Result<(), SessionError> {
        self.state = ElectionState::NewLeader;
        self.epoch += 1;
        self.publish();

        let socket = UdpSocket::bind((self.options.bind_ip, 0)).await?;
        let handoff = Handoff {
            round: self.round,
            epoch: self.epoch,
            history: self.history.clone(),
            grid: self.grid.clone(),
            roster: self.roster.clone(),
        };
        let mut coordinator = Coordinator::take_over(socket, self.config.clone(), handoff);
        let leader = coordinator.local_addr()?;
        coordinator.announce().await?;

        if let Some(previous) = self.coordinator.take() {
            previous.abort();
        }
        self.coordinator = Some(spawn_coordinator(coordinator, false));

        info!(target: "election", "Leading epoch {} from {}", self.epoch, leader);
        self.leader = leader;
        self.is_leader = true;
        self.state = ElectionState::Normal;
        self.publish();
        Ok(())
    }
}

impl Drop for Follower {
    fn drop(&mut self) {
        if let Some(handle) = self.coordinator.take() {
            handle.abort();
        }
    }
}

async fn election_outcome(election: &mut Option<ActiveElection>) -> ElectionOutcome {
    match election {
        Some(active) => active.outcome().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{decision_channels, DecisionPort};
    use shared::{GameStart, Position};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            follower_response_time: Duration::from_millis(200),
            min_game_speed: Duration::from_millis(5),
            lobby_timeout: Duration::from_millis(300),
            max_missed_messages: 3,
            ..SessionConfig::default()
        }
    }

    fn options(leader_addr: SocketAddr) -> PeerOptions {
        PeerOptions {
            bind_ip: "127.0.0.1".parse().unwrap(),
            leader_addr,
            is_leader: false,
            nickname: "tester".to_string(),
            width: 40,
            height: 40,
        }
    }

    async fn recv(socket: &UdpSocket) -> (Message, SocketAddr) {
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        let deadline = Instant::now() + Duration::from_secs(2);
        let (len, from) = recv_until(socket, &mut buffer, deadline)
            .await
            .unwrap()
            .expect("timed out");
        (wire::decode(&buffer[..len]).unwrap(), from)
    }

    /// A fake leader socket that admits one follower as player 1.
    async fn joined_follower() -> (Follower, UdpSocket, DecisionPort) {
        let leader = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (decider, mut port) = decision_channels();
        let join = tokio::spawn(Follower::join(
            options(leader.local_addr().unwrap()),
            fast_config(),
            decider,
        ));

        let (message, from) = recv(&leader).await;
        assert_eq!(
            message,
            Message::Join {
                nickname: "tester".to_string()
            }
        );

        let mut starting_positions = BTreeMap::new();
        starting_positions.insert(Pid(1), Position::new(20, 20, Direction::Left));
        let mut addresses = BTreeMap::new();
        addresses.insert(from.to_string(), Pid(1));
        let game_start = GameStart {
            pid: Pid(1),
            starting_positions,
            nicknames: BTreeMap::new(),
            addresses,
        };
        send_message(&leader, &Message::GameStart { round: 1, game_start }, from)
            .await
            .unwrap();

        assert!(matches!(
            port.events.recv().await,
            Some(DecisionEvent::GameStart { round: 1, .. })
        ));
        let follower = join.await.unwrap().unwrap();
        (follower, leader, port)
    }

    #[tokio::test]
    async fn test_join_gives_up_on_silent_leader() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (decider, _port) = decision_channels();
        let mut config = fast_config();
        config.lobby_timeout = Duration::from_millis(50);

        let result = Follower::join(options(silent.local_addr().unwrap()), config, decider).await;
        assert!(matches!(result, Err(SessionError::LeaderUnreachable(_))));
    }

    #[tokio::test]
    async fn test_answers_round_and_mirrors_moves() {
        let (follower, leader, mut port) = joined_follower().await;
        let follower_addr = follower.local_addr();
        let status = follower.subscribe();
        tokio::spawn(follower.run());

        send_message(&leader, &Message::RoundStart { round: 2 }, follower_addr)
            .await
            .unwrap();
        assert_eq!(
            port.events.recv().await,
            Some(DecisionEvent::RoundStart { round: 2 })
        );
        port.decide(Decision::Move(Direction::Down)).await.unwrap();

        let (reply, _) = recv(&leader).await;
        assert_eq!(
            reply,
            Message::MyMove {
                round: 2,
                pid: Pid(1),
                direction: Direction::Down
            }
        );
        assert_eq!(status.borrow().round, 2);

        // A repeated roundstart is not answered twice
        send_message(&leader, &Message::RoundStart { round: 2 }, follower_addr)
            .await
            .unwrap();

        let mut snapshot = Snapshot::new();
        snapshot.insert(Pid(1), Position::new(20, 19, Direction::Down));
        let moves = vec![Snapshot::new(), snapshot];
        send_message(
            &leader,
            &Message::Moves {
                round: 2,
                moves: moves.clone(),
            },
            follower_addr,
        )
        .await
        .unwrap();
        assert_eq!(
            port.events.recv().await,
            Some(DecisionEvent::Moves { round: 2, moves })
        );
    }

    #[tokio::test]
    async fn test_died_reply_continues_last_direction() {
        let (follower, leader, mut port) = joined_follower().await;
        let follower_addr = follower.local_addr();
        tokio::spawn(follower.run());

        send_message(&leader, &Message::RoundStart { round: 2 }, follower_addr)
            .await
            .unwrap();
        port.events.recv().await.unwrap();
        port.decide(Decision::Died).await.unwrap();

        let (reply, _) = recv(&leader).await;
        assert_eq!(
            reply,
            Message::MyMove {
                round: 2,
                pid: Pid(1),
                direction: Direction::Left
            }
        );
    }

    #[tokio::test]
    async fn test_ignores_strangers_and_stale_leaders() {
        let (follower, leader, mut port) = joined_follower().await;
        let follower_addr = follower.local_addr();
        let status = follower.subscribe();
        tokio::spawn(follower.run());

        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        send_message(&stranger, &Message::RoundStart { round: 5 }, follower_addr)
            .await
            .unwrap();
        // Same epoch as ours: ignored
        send_message(
            &stranger,
            &Message::NewLeader(Ballot {
                round: 5,
                leader_id: 0,
            }),
            follower_addr,
        )
        .await
        .unwrap();

        send_message(&leader, &Message::RoundStart { round: 2 }, follower_addr)
            .await
            .unwrap();
        assert_eq!(
            port.events.recv().await,
            Some(DecisionEvent::RoundStart { round: 2 })
        );
        let current = status.borrow().clone();
        assert_eq!(current.leader, leader.local_addr().unwrap());
        assert_eq!(current.epoch, 0);
    }

    #[tokio::test]
    async fn test_newer_epoch_changes_leader() {
        let (follower, _leader, _port) = joined_follower().await;
        let follower_addr = follower.local_addr();
        let mut status = follower.subscribe();
        tokio::spawn(follower.run());

        let successor = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        send_message(
            &successor,
            &Message::NewLeader(Ballot {
                round: 1,
                leader_id: 1,
            }),
            follower_addr,
        )
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while status.borrow().epoch != 1 {
                status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!(status.borrow().leader, successor.local_addr().unwrap());
        assert!(!status.borrow().is_leader);
    }

    #[tokio::test]
    async fn test_lone_follower_takes_over() {
        let (follower, _leader, mut port) = joined_follower().await;
        let mut status = follower.subscribe();
        tokio::spawn(follower.run());

        // The fake leader never speaks again, so the follower elects itself
        // and its own coordinator starts the next round.
        let event = tokio::time::timeout(Duration::from_secs(3), port.events.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(DecisionEvent::RoundStart { round: 2 }));

        let current = status.borrow_and_update().clone();
        assert_eq!(current.epoch, 1);
        assert!(current.is_leader);
        assert_eq!(current.election, ElectionState::Normal);
    }
}
