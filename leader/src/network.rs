//! Round coordinator: lobby, lock-step round loop and takeover after an election

use crate::game::{Handoff, Outcome, RoundState};
use crate::membership::Registration;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::config::FAIL_RATE_SCALE;
use shared::net::{broadcast, recv_until, send_message, MAX_DATAGRAM};
use shared::wire::{self, Ballot, Message};
use shared::{Direction, Pid, Round, RoundMetrics, SessionConfig, SessionError};
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::Instant;

/// Authoritative leader for one game session
///
/// Owns its socket and the only copy of the authoritative round state. It is
/// driven to completion by [`Coordinator::run`] (fresh session) or
/// [`Coordinator::run_rounds`] (after a takeover).
pub struct Coordinator {
    socket: UdpSocket,
    state: RoundState,
    config: SessionConfig,
    rng: StdRng,
    metrics: RoundMetrics,
}

fn session_rng(config: &SessionConfig) -> StdRng {
    match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

impl Coordinator {
    pub async fn bind(
        addr: &str,
        width: i32,
        height: i32,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let state = RoundState::new(width, height, &config)?;
        let socket = UdpSocket::bind(addr).await?;
        info!(target: "leader", "Coordinator listening on {}", socket.local_addr()?);

        Ok(Self {
            socket,
            state,
            rng: session_rng(&config),
            metrics: RoundMetrics::new(config.metrics),
            config,
        })
    }

    /// Continues a session from a follower's mirrored state
    pub fn take_over(socket: UdpSocket, config: SessionConfig, handoff: Handoff) -> Self {
        info!(
            target: "leader",
            "Taking over at round {} with epoch {} ({} players)",
            handoff.round,
            handoff.epoch,
            handoff.roster.len()
        );

        Self {
            socket,
            state: RoundState::from_handoff(handoff, &config),
            rng: session_rng(&config),
            metrics: RoundMetrics::new(config.metrics),
            config,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn state(&self) -> &RoundState {
        &self.state
    }

    pub fn metrics(&self) -> &RoundMetrics {
        &self.metrics
    }

    /// Lobby then rounds; returns the finish order once the game is over
    pub async fn run(mut self) -> Result<Vec<Pid>, SessionError> {
        self.run_lobby().await?;
        self.run_rounds().await
    }

    /// Registers joins until `START` arrives or the lobby goes quiet
    ///
    /// Every datagram except a repeated join restarts the idle timer.
    pub async fn run_lobby(&mut self) -> Result<(), SessionError> {
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        let mut deadline = Instant::now() + self.config.lobby_timeout;

        loop {
            let Some((len, from)) = recv_until(&self.socket, &mut buffer, deadline).await? else {
                if self.state.membership().is_empty() {
                    debug!(target: "leader", "Lobby idle with no players, still waiting");
                    deadline = Instant::now() + self.config.lobby_timeout;
                    continue;
                }
                info!(target: "leader", "Lobby timed out, starting the game");
                break;
            };
            self.metrics.record_read(len);

            match wire::decode(&buffer[..len]) {
                Ok(Message::Join { nickname }) => {
                    let registration = self.state.register(from, &nickname, &mut self.rng);
                    if let Registration::New(_) = registration {
                        deadline = Instant::now() + self.config.lobby_timeout;
                    }
                    continue;
                }
                Ok(Message::Start) if self.state.membership().is_empty() => {
                    warn!(target: "leader", "START from {} before anyone joined", from);
                }
                Ok(Message::Start) => {
                    info!(target: "leader", "Received START from {}", from);
                    break;
                }
                Ok(other) => {
                    debug!(target: "leader", "Ignoring {} from {} in the lobby", other.kind().as_str(), from);
                }
                Err(e) => {
                    warn!(target: "leader", "Discarding malformed datagram from {}: {}", from, e);
                }
            }
            deadline = Instant::now() + self.config.lobby_timeout;
        }

        self.start_game().await
    }

    async fn start_game(&mut self) -> Result<(), SessionError> {
        self.state.mark_start_cells();

        for pid in self.state.membership().pids() {
            let Some(addr) = self.state.membership().get(pid).map(|player| player.addr) else {
                continue;
            };
            let message = Message::GameStart {
                round: self.state.round,
                game_start: self.state.game_start_for(pid),
            };
            let written = send_message(&self.socket, &message, addr).await?;
            self.metrics.record_written(written);
        }

        info!(
            target: "leader",
            "Game started with {} players",
            self.state.membership().len()
        );
        Ok(())
    }

    /// Tells every player that this socket now leads, tagged with the epoch
    pub async fn announce(&mut self) -> Result<(), SessionError> {
        let ballot = Ballot {
            round: self.state.round,
            leader_id: self.state.epoch,
        };
        let written = broadcast(
            &self.socket,
            &Message::NewLeader(ballot),
            self.state.membership().addresses(),
        )
        .await?;
        self.metrics.record_written(written);
        Ok(())
    }

    pub async fn run_rounds(&mut self) -> Result<Vec<Pid>, SessionError> {
        loop {
            if let Some(finish) = self.play_round().await? {
                return Ok(finish);
            }
        }
    }

    /// Plays one lock-step round; returns the finish order if it ended the game
    pub async fn play_round(&mut self) -> Result<Option<Vec<Pid>>, SessionError> {
        let round = self.state.begin_round();
        self.metrics.round_started(round, self.state.epoch);
        let addresses = self.state.membership().addresses();
        let written =
            broadcast(&self.socket, &Message::RoundStart { round }, addresses.iter().copied()).await?;
        self.metrics.record_written(written);

        self.collect_moves(round).await?;

        for pid in self.state.update_grace_period() {
            self.broadcast_kill(round, pid).await?;
        }

        if self.state.is_game_over() {
            let finish = self.state.finish();
            info!(target: "leader", "Game over in round {}, finish order {:?}", round, finish);
            let message = Message::GameOver {
                round,
                pids_in_order_of_death: finish.clone(),
            };
            let written = broadcast(&self.socket, &message, addresses).await?;
            self.metrics.record_written(written);
            self.metrics.report("leader");
            return Ok(Some(finish));
        }

        let message = Message::Moves {
            round,
            moves: self.state.window(),
        };
        let written = broadcast(&self.socket, &message, addresses).await?;
        self.metrics.record_written(written);
        Ok(None)
    }

    async fn collect_moves(&mut self, round: Round) -> Result<(), SessionError> {
        let deadline = Instant::now() + self.config.follower_response_time;
        let mut buffer = vec![0u8; MAX_DATAGRAM];

        while !self.state.responses_complete() {
            let received = match recv_until(&self.socket, &mut buffer, deadline).await {
                Ok(received) => received,
                Err(e) => {
                    warn!(target: "leader", "Error receiving moves: {}", e);
                    if Instant::now() >= deadline {
                        break;
                    }
                    continue;
                }
            };
            let Some((len, from)) = received else {
                debug!(target: "leader", "Move deadline passed in round {}", round);
                break;
            };
            self.metrics.record_read(len);

            match wire::decode(&buffer[..len]) {
                Ok(Message::MyMove {
                    round: move_round,
                    pid,
                    direction,
                }) => self.receive_move(round, move_round, pid, direction).await?,
                Ok(other) => {
                    debug!(
                        target: "leader",
                        "Ignoring {} from {} in round {}",
                        other.kind().as_str(),
                        from,
                        round
                    );
                }
                Err(e) => {
                    warn!(target: "leader", "Discarding malformed datagram from {}: {}", from, e);
                }
            }
        }

        Ok(())
    }

    async fn receive_move(
        &mut self,
        round: Round,
        move_round: Round,
        pid: Pid,
        direction: Direction,
    ) -> Result<(), SessionError> {
        if let Err(rejection) = self.state.check_move(move_round, pid) {
            debug!(
                target: "leader",
                "Discarding move from player {} for round {}: {:?}",
                pid,
                move_round,
                rejection
            );
            return Ok(());
        }

        if self.injected_failure(pid) {
            info!(target: "leader", "Dropping move from player {} in round {} (fault injection)", pid, round);
            return Ok(());
        }

        if let Some(Outcome::Collided(_)) = self.state.apply_move(pid, direction) {
            self.broadcast_kill(round, pid).await?;
        }
        Ok(())
    }

    fn injected_failure(&mut self, pid: Pid) -> bool {
        match self.config.fail_rates.get(&pid) {
            Some(&rate) if rate > 0 => self.rng.gen_range(0..FAIL_RATE_SCALE) < rate,
            _ => false,
        }
    }

    async fn broadcast_kill(&mut self, round: Round, pid: Pid) -> Result<(), SessionError> {
        let written = broadcast(
            &self.socket,
            &Message::KillPlayer { round, pid },
            self.state.membership().addresses(),
        )
        .await?;
        self.metrics.record_written(written);
        Ok(())
    }
}
