//! Session tuning shared by both binaries.

use crate::{Pid, PositionHistory, SessionError};
use clap::Args;
use std::collections::HashMap;
use std::time::Duration;

/// Grids smaller than this leave no room for the spawn margin.
pub const MIN_GRID_DIMENSION: i32 = 30;

/// Starting positions keep at least this many cells away from every edge.
pub const SPAWN_MARGIN: i32 = 15;

/// Fault-injection rates are expressed out of this many responses.
pub const FAIL_RATE_SCALE: u32 = 1000;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long the leader collects moves, and how long a follower waits for
    /// the leader before suspecting it.
    pub follower_response_time: Duration,
    /// Minimum pause the decision process takes before answering a round.
    pub min_game_speed: Duration,
    /// Consecutive missed rounds before a player is dropped forever. Also
    /// the depth of the position history window.
    pub max_missed_messages: u32,
    /// Idle time after which the lobby starts the game on its own.
    pub lobby_timeout: Duration,
    pub collision_is_death: bool,
    /// Debug switch for solo games: never declare the game over.
    pub disable_game_over: bool,
    /// Per-player chance, out of [`FAIL_RATE_SCALE`], that the leader
    /// pretends a move never arrived.
    pub fail_rates: HashMap<Pid, u32>,
    pub seed: Option<u64>,
    pub metrics: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            follower_response_time: Duration::from_millis(2000),
            min_game_speed: Duration::from_millis(25),
            max_missed_messages: 5,
            lobby_timeout: Duration::from_secs(15),
            collision_is_death: true,
            disable_game_over: false,
            fail_rates: HashMap::new(),
            seed: None,
            metrics: false,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.follower_response_time < self.min_game_speed {
            return Err(SessionError::Config(format!(
                "response time {:?} is shorter than the minimum game speed {:?}",
                self.follower_response_time, self.min_game_speed
            )));
        }

        if (self.max_missed_messages as usize) < PositionHistory::MIN_DEPTH {
            return Err(SessionError::Config(format!(
                "max missed messages must be at least {}, got {}",
                PositionHistory::MIN_DEPTH,
                self.max_missed_messages
            )));
        }

        if let Some((pid, rate)) = self
            .fail_rates
            .iter()
            .find(|(_, rate)| **rate > FAIL_RATE_SCALE)
        {
            return Err(SessionError::Config(format!(
                "fail rate {} for player {} exceeds {}",
                rate, pid, FAIL_RATE_SCALE
            )));
        }

        Ok(())
    }

    pub fn history_depth(&self) -> usize {
        self.max_missed_messages as usize
    }
}

/// Checks that a grid can fit starting positions.
pub fn validate_grid(width: i32, height: i32) -> Result<(), SessionError> {
    if width < MIN_GRID_DIMENSION || height < MIN_GRID_DIMENSION {
        return Err(SessionError::Config(format!(
            "game grid {}x{} is too small, both sides need at least {} cells",
            width, height, MIN_GRID_DIMENSION
        )));
    }
    Ok(())
}

/// Command line knobs flattened into both the `leader` and `peer` binaries.
#[derive(Args, Debug, Clone)]
pub struct TuningArgs {
    /// Milliseconds the leader waits for moves and followers wait for the leader
    #[arg(long, default_value = "2000")]
    pub response_time_ms: u64,

    /// Milliseconds the decision process pauses before answering a round
    #[arg(long, default_value = "25")]
    pub min_game_speed_ms: u64,

    /// Consecutive missed rounds before a player is dropped
    #[arg(long, default_value = "5")]
    pub max_missed: u32,

    /// Idle milliseconds before the lobby starts the game by itself
    #[arg(long, default_value = "15000")]
    pub lobby_timeout_ms: u64,

    /// Let players pass through walls and trails
    #[arg(long)]
    pub no_collision_death: bool,

    /// Never end the game (single player debugging)
    #[arg(long)]
    pub disable_game_over: bool,

    /// Drop a player's moves on purpose, e.g. `--fail-rate 2=250` (out of 1000)
    #[arg(long = "fail-rate", value_parser = parse_fail_rate)]
    pub fail_rates: Vec<(Pid, u32)>,

    /// Seed for spawn positions, fault injection and the AI
    #[arg(long)]
    pub seed: Option<u64>,

    /// Log round latency and throughput samples
    #[arg(long)]
    pub metrics: bool,
}

impl TuningArgs {
    pub fn into_config(self) -> Result<SessionConfig, SessionError> {
        let config = SessionConfig {
            follower_response_time: Duration::from_millis(self.response_time_ms),
            min_game_speed: Duration::from_millis(self.min_game_speed_ms),
            max_missed_messages: self.max_missed,
            lobby_timeout: Duration::from_millis(self.lobby_timeout_ms),
            collision_is_death: !self.no_collision_death,
            disable_game_over: self.disable_game_over,
            fail_rates: self.fail_rates.into_iter().collect(),
            seed: self.seed,
            metrics: self.metrics,
        };
        config.validate()?;
        Ok(config)
    }
}

fn parse_fail_rate(raw: &str) -> Result<(Pid, u32), String> {
    let (pid, rate) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected PID=RATE, got `{}`", raw))?;
    let pid: Pid = pid.parse().map_err(|e| format!("bad pid `{}`: {}", pid, e))?;
    let rate: u32 = rate
        .trim()
        .parse()
        .map_err(|e| format!("bad rate `{}`: {}", rate, e))?;
    if rate > FAIL_RATE_SCALE {
        return Err(format!("rate {} exceeds {}", rate, FAIL_RATE_SCALE));
    }
    Ok((pid, rate))
}
