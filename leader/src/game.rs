use crate::membership::{Membership, Registration};
use log::{debug, info};
use rand::Rng;
use shared::config::{validate_grid, SPAWN_MARGIN};
use shared::{
    Direction, Epoch, GameStart, Grid, Pid, Position, PositionHistory, Round, SessionConfig,
    SessionError, Snapshot,
};
use std::net::SocketAddr;

/// State a follower hands to the coordinator it starts after winning an election.
#[derive(Debug, Clone)]
pub struct Handoff {
    pub round: Round,
    pub epoch: Epoch,
    pub history: PositionHistory,
    pub grid: Grid,
    pub roster: Membership,
}

/// Why a `myMove` was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Stale,
    UnknownPlayer,
    Dropped,
    /// The pid already has a position this round; the first response wins.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Moved(Position),
    /// Dead players stay where they died.
    Held(Position),
    /// The target cell was blocked; the player died and held its position.
    Collided(Position),
}

/// Authoritative session state owned by the round coordinator.
#[derive(Debug)]
pub struct RoundState {
    pub round: Round,
    pub epoch: Epoch,
    grid: Grid,
    history: PositionHistory,
    membership: Membership,
    collision_is_death: bool,
    disable_game_over: bool,
}

impl RoundState {
    pub fn new(width: i32, height: i32, config: &SessionConfig) -> Result<Self, SessionError> {
        validate_grid(width, height)?;

        Ok(Self {
            round: 1,
            epoch: 0,
            grid: Grid::new(width, height),
            history: PositionHistory::new(config.history_depth())?,
            membership: Membership::new(config.max_missed_messages),
            collision_is_death: config.collision_is_death,
            disable_game_over: config.disable_game_over,
        })
    }

    pub fn from_handoff(handoff: Handoff, config: &SessionConfig) -> Self {
        Self {
            round: handoff.round,
            epoch: handoff.epoch,
            grid: handoff.grid,
            history: handoff.history,
            membership: handoff.roster,
            collision_is_death: config.collision_is_death,
            disable_game_over: config.disable_game_over,
        }
    }

    /// Registers a lobby join and gives new players a random starting position.
    pub fn register<R: Rng>(
        &mut self,
        addr: SocketAddr,
        nickname: &str,
        rng: &mut R,
    ) -> Registration {
        let registration = self.membership.register(addr, nickname);

        if let Registration::New(pid) = registration {
            let x = rng.gen_range(SPAWN_MARGIN..=self.grid.width() - SPAWN_MARGIN);
            let y = rng.gen_range(SPAWN_MARGIN..=self.grid.height() - SPAWN_MARGIN);
            let direction = Direction::ALL[rng.gen_range(0..Direction::ALL.len())];
            let start = Position::new(x, y, direction);

            debug!(target: "leader", "Player {} starts at ({}, {}) facing {:?}", pid, x, y, direction);
            self.history.current_mut().insert(pid, start);
        }

        registration
    }

    /// Claims every starting cell as its player's first trail cell.
    pub fn mark_start_cells(&mut self) {
        for (pid, position) in self.history.current() {
            self.grid.occupy(position, *pid);
        }
    }

    /// The `gameStart` payload addressed to `pid`.
    pub fn game_start_for(&self, pid: Pid) -> GameStart {
        GameStart {
            pid,
            starting_positions: self.history.current().clone(),
            nicknames: self.membership.nicknames(),
            addresses: self.membership.address_book(),
        }
    }

    pub fn begin_round(&mut self) -> Round {
        self.round += 1;
        self.history.slide();
        self.round
    }

    pub fn check_move(&self, round: Round, pid: Pid) -> Result<(), Rejection> {
        if round != self.round {
            return Err(Rejection::Stale);
        }
        if self.membership.get(pid).is_none() {
            return Err(Rejection::UnknownPlayer);
        }
        if self.membership.is_dropped(pid) {
            return Err(Rejection::Dropped);
        }
        if self.history.current().contains_key(&pid) {
            return Err(Rejection::Duplicate);
        }
        Ok(())
    }

    /// Resolves one step for `pid` into the current snapshot.
    ///
    /// Returns None if the player has no earlier position to step from.
    pub fn apply_move(&mut self, pid: Pid, direction: Direction) -> Option<Outcome> {
        let previous = *self
            .history
            .previous(pid)
            .or_else(|| self.history.latest(pid))?;

        if !self.membership.is_alive(pid) {
            self.history.current_mut().insert(pid, previous);
            return Some(Outcome::Held(previous));
        }

        let next = previous.step(direction, self.grid.width(), self.grid.height());

        if self.collision_is_death && self.grid.is_blocked(next.x, next.y) {
            info!(target: "leader", "Player {} crashed at ({}, {})", pid, next.x, next.y);
            self.membership.kill(pid);
            self.history.current_mut().insert(pid, previous);
            return Some(Outcome::Collided(previous));
        }

        self.grid.occupy(&next, pid);
        self.history.current_mut().insert(pid, next);
        Some(Outcome::Moved(next))
    }

    /// Settles grace counters once the move deadline has passed.
    ///
    /// Players that answered get their counter reset. Everyone else counts a
    /// missed round and, if still alive, keeps going in its last direction.
    /// Returns the players that died here: dropped for silence, or crashed on
    /// a continuation move.
    pub fn update_grace_period(&mut self) -> Vec<Pid> {
        let mut killed = Vec::new();

        for pid in self.membership.pids() {
            if self.history.current().contains_key(&pid) {
                self.membership.reset_grace(pid);
                continue;
            }

            let was_alive = self.membership.is_alive(pid);
            if self.membership.count_grace(pid) {
                info!(target: "leader", "Player {} dropped in round {}", pid, self.round);
                if was_alive {
                    killed.push(pid);
                }
            }

            let Some(previous) = self.history.previous(pid).copied() else {
                continue;
            };

            if self.membership.is_alive(pid) {
                debug!(target: "leader", "Continuing player {} {:?}", pid, previous.direction);
                if let Some(Outcome::Collided(_)) = self.apply_move(pid, previous.direction) {
                    killed.push(pid);
                }
            } else {
                self.history.current_mut().insert(pid, previous);
            }
        }

        killed
    }

    pub fn responses_complete(&self) -> bool {
        self.history.current().len() >= self.membership.response_quorum()
    }

    pub fn is_game_over(&self) -> bool {
        self.membership.is_game_over(self.disable_game_over)
    }

    /// Crowns the survivors and returns the final ranking, first out first.
    pub fn finish(&mut self) -> Vec<Pid> {
        self.membership.crown_survivors();
        self.membership.finish_order().to_vec()
    }

    pub fn window(&self) -> Vec<Snapshot> {
        self.history.window()
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn history(&self) -> &PositionHistory {
        &self.history
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }
}
