//! Fixed-depth sliding window of per-round position snapshots.
//!
//! Slot `depth - 1` is the round in flight, slot `depth - 2` the round before
//! it. The coordinator slides exactly once per round start, which bounds both
//! memory and how far back a continuation move can look.

use crate::{Pid, Position, SessionError};
use std::collections::{BTreeMap, VecDeque};

/// Positions of every player that has one in a given round.
pub type Snapshot = BTreeMap<Pid, Position>;

#[derive(Debug, Clone, PartialEq)]
pub struct PositionHistory {
    slots: VecDeque<Snapshot>,
}

impl PositionHistory {
    /// `previous` needs at least two slots.
    pub const MIN_DEPTH: usize = 2;

    pub fn new(depth: usize) -> Result<Self, SessionError> {
        if depth < Self::MIN_DEPTH {
            return Err(SessionError::Config(format!(
                "position history depth {} is below the minimum of {}",
                depth,
                Self::MIN_DEPTH
            )));
        }

        Ok(Self {
            slots: (0..depth).map(|_| Snapshot::new()).collect(),
        })
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn current(&self) -> &Snapshot {
        &self.slots[self.slots.len() - 1]
    }

    pub fn current_mut(&mut self) -> &mut Snapshot {
        let last = self.slots.len() - 1;
        &mut self.slots[last]
    }

    /// Position of `pid` in the round before the current one.
    pub fn previous(&self, pid: Pid) -> Option<&Position> {
        self.slots[self.slots.len() - 2].get(&pid)
    }

    /// Newest known position of `pid`, searching back through the window.
    pub fn latest(&self, pid: Pid) -> Option<&Position> {
        self.slots.iter().rev().find_map(|slot| slot.get(&pid))
    }

    /// Drops the oldest snapshot and opens an empty one for the next round.
    pub fn slide(&mut self) {
        self.slots.pop_front();
        self.slots.push_back(Snapshot::new());
    }

    /// All snapshots, oldest first.
    pub fn window(&self) -> Vec<Snapshot> {
        self.slots.iter().cloned().collect()
    }

    /// Overwrites the newest slots with a window received from the leader.
    ///
    /// Windows are aligned on their newest end; extra old snapshots are
    /// ignored and a short window leaves the oldest local slots untouched.
    pub fn replace_window(&mut self, window: Vec<Snapshot>) {
        let depth = self.depth();
        let skip = window.len().saturating_sub(depth);
        let incoming: Vec<Snapshot> = window.into_iter().skip(skip).collect();
        let offset = depth - incoming.len();

        for (i, snapshot) in incoming.into_iter().enumerate() {
            self.slots[offset + i] = snapshot;
        }
    }
}
