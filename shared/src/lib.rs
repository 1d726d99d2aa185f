//! Types shared by the leader (round coordinator) and the peer (follower) crates.
//!
//! Everything that crosses a process boundary lives here: the wire codec, the
//! position model, the sliding position history, the occupancy grid and the
//! traffic counters. Both roles in a process keep their *own* instances of
//! these structures; nothing in this crate is meant to be shared mutably
//! between tasks.

pub mod config;
pub mod error;
pub mod grid;
pub mod history;
pub mod metrics;
pub mod net;
pub mod wire;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

pub use config::{SessionConfig, TuningArgs};
pub use error::{SessionError, WireError};
pub use grid::{Cell, Grid};
pub use history::{PositionHistory, Snapshot};
pub use metrics::RoundMetrics;
pub use wire::{Ballot, GameStart, Message, MessageKind};

/// Lock-step round number. Starts at 1 in the lobby.
pub type Round = u64;

/// Leader term. Every election winner increments it.
pub type Epoch = u64;

/// Player id, assigned sequentially from 1 by the leader's lobby.
///
/// On the wire a pid is a decimal string (`"3"`), both as a value and as a
/// JSON object key. Integers are accepted on input because the decision
/// process writes them that way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Pid {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Pid)
    }
}

impl Serialize for Pid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Pid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawPid {
            Text(String),
            Number(u32),
        }

        match RawPid::deserialize(deserializer)? {
            RawPid::Text(text) => text.parse().map_err(serde::de::Error::custom),
            RawPid::Number(number) => Ok(Pid(number)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Down,
        Direction::Left,
        Direction::Up,
        Direction::Right,
    ];
}

/// Where one player is at the end of one round, and which way it faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
    pub direction: Direction,
}

impl Position {
    pub fn new(x: i32, y: i32, direction: Direction) -> Self {
        Self { x, y, direction }
    }

    /// Moves one cell in `direction`, clamped to the grid bounds.
    ///
    /// `UP` grows y and `DOWN` shrinks it, matching the decision process's
    /// coordinate system. Edge cells are walls on a real grid, so a clamped
    /// step still lands on a blocked cell when collisions are deadly.
    pub fn step(&self, direction: Direction, width: i32, height: i32) -> Position {
        let (mut x, mut y) = (self.x, self.y);
        match direction {
            Direction::Down => y = (y - 1).max(0),
            Direction::Up => y = (y + 1).min(height - 1),
            Direction::Left => x = (x - 1).max(0),
            Direction::Right => x = (x + 1).min(width - 1),
        }
        Position { x, y, direction }
    }
}
