//! Player roster and liveness tracking for the round coordinator
//!
//! This module owns everything the leader knows about who is playing:
//! - Registration of lobby joins, idempotent per follower address
//! - Alive/dead status and the order in which players died
//! - Grace counters for players that miss rounds, and dropping them for good
//!
//! A follower rebuilds the same table from its `gameStart` so that it can take
//! over as coordinator after an election.

use log::{debug, info, warn};
use shared::{Pid, SessionError};
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// One registered player as the coordinator sees it
#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub pid: Pid,
    pub nickname: String,
    /// Follower socket the player joined from
    pub addr: SocketAddr,
    pub alive: bool,
    /// Missed `max_missed_messages` rounds in a row; never counted again
    pub dropped_forever: bool,
    /// Consecutive rounds without a response
    pub grace: u32,
}

impl Player {
    fn new(pid: Pid, nickname: String, addr: SocketAddr) -> Self {
        Self {
            pid,
            nickname,
            addr,
            alive: true,
            dropped_forever: false,
            grace: 0,
        }
    }
}

/// Outcome of a lobby join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    New(Pid),
    /// The address had already joined; the existing pid is returned
    Known(Pid),
}

impl Registration {
    pub fn pid(self) -> Pid {
        match self {
            Registration::New(pid) | Registration::Known(pid) => pid,
        }
    }
}

/// Liveness table for every player in the session
///
/// Pids are handed out sequentially from 1. The finish list records deaths in
/// order; once the game is over the survivors are appended so that it ends up
/// ranking every player.
#[derive(Debug, Clone)]
pub struct Membership {
    players: BTreeMap<Pid, Player>,
    finish: Vec<Pid>,
    next_pid: u32,
    max_missed: u32,
}

impl Membership {
    pub fn new(max_missed: u32) -> Self {
        Self {
            players: BTreeMap::new(),
            finish: Vec::new(),
            next_pid: 1,
            max_missed,
        }
    }

    /// Rebuilds the table from a `gameStart` roster
    ///
    /// Every player starts alive with a fresh grace counter. Fails if an
    /// address in the roster is not a valid `ip:port`.
    pub fn from_roster(
        addresses: &BTreeMap<String, Pid>,
        nicknames: &BTreeMap<Pid, String>,
        max_missed: u32,
    ) -> Result<Self, SessionError> {
        let mut membership = Self::new(max_missed);

        for (addr, pid) in addresses {
            let addr: SocketAddr = addr
                .parse()
                .map_err(|_| SessionError::BadAddress(addr.clone()))?;
            let nickname = nicknames.get(pid).cloned().unwrap_or_default();
            membership.players.insert(*pid, Player::new(*pid, nickname, addr));
            membership.next_pid = membership.next_pid.max(pid.0 + 1);
        }

        Ok(membership)
    }

    pub fn register(&mut self, addr: SocketAddr, nickname: &str) -> Registration {
        if let Some(pid) = self.pid_for(addr) {
            debug!(target: "leader", "Player {} rejoined from {}", pid, addr);
            return Registration::Known(pid);
        }

        let pid = Pid(self.next_pid);
        self.next_pid += 1;

        info!(target: "leader", "Player {} ({}) joined from {}", pid, nickname, addr);
        self.players
            .insert(pid, Player::new(pid, nickname.to_string(), addr));
        Registration::New(pid)
    }

    pub fn reset_grace(&mut self, pid: Pid) {
        if let Some(player) = self.players.get_mut(&pid) {
            player.grace = 0;
        }
    }

    /// Counts one missed round against `pid`
    ///
    /// Returns true when this call dropped the player forever. Dropping also
    /// kills the player.
    pub fn count_grace(&mut self, pid: Pid) -> bool {
        let max_missed = self.max_missed;
        let dropped = match self.players.get_mut(&pid) {
            Some(player) if !player.dropped_forever => {
                player.grace += 1;
                if player.grace >= max_missed {
                    player.dropped_forever = true;
                    true
                } else {
                    false
                }
            }
            _ => false,
        };

        if dropped {
            warn!(target: "leader", "Player {} missed {} rounds, dropping", pid, max_missed);
            self.kill(pid);
        }
        dropped
    }

    /// Marks `pid` dead; returns false if it was already dead or unknown
    pub fn kill(&mut self, pid: Pid) -> bool {
        match self.players.get_mut(&pid) {
            Some(player) if player.alive => {
                player.alive = false;
                self.finish.push(pid);
                info!(target: "leader", "Player {} is out", pid);
                true
            }
            _ => false,
        }
    }

    /// All but one player are dead
    pub fn is_game_over(&self, disable_game_over: bool) -> bool {
        if disable_game_over {
            return false;
        }
        self.finish.len() >= self.players.len().saturating_sub(1)
    }

    /// Appends the players still alive to the finish list
    pub fn crown_survivors(&mut self) {
        let survivors: Vec<Pid> = self
            .players
            .values()
            .filter(|player| player.alive && !self.finish.contains(&player.pid))
            .map(|player| player.pid)
            .collect();
        self.finish.extend(survivors);
    }

    /// Number of responses that completes a round early
    pub fn response_quorum(&self) -> usize {
        self.players
            .values()
            .filter(|player| !player.dropped_forever)
            .count()
    }

    pub fn pid_for(&self, addr: SocketAddr) -> Option<Pid> {
        self.players
            .values()
            .find(|player| player.addr == addr)
            .map(|player| player.pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&Player> {
        self.players.get(&pid)
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.players.values().map(|player| player.addr).collect()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.players.keys().copied().collect()
    }

    pub fn is_alive(&self, pid: Pid) -> bool {
        self.players.get(&pid).map_or(false, |player| player.alive)
    }

    pub fn is_dropped(&self, pid: Pid) -> bool {
        self.players
            .get(&pid)
            .map_or(false, |player| player.dropped_forever)
    }

    pub fn finish_order(&self) -> &[Pid] {
        &self.finish
    }

    pub fn nicknames(&self) -> BTreeMap<Pid, String> {
        self.players
            .values()
            .map(|player| (player.pid, player.nickname.clone()))
            .collect()
    }

    /// `"ip:port"` → pid, the shape carried by `gameStart`
    pub fn address_book(&self) -> BTreeMap<String, Pid> {
        self.players
            .values()
            .map(|player| (player.addr.to_string(), player.pid))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn three_players() -> Membership {
        let mut membership = Membership::new(3);
        membership.register(test_addr(9001), "a");
        membership.register(test_addr(9002), "b");
        membership.register(test_addr(9003), "c");
        membership
    }

    #[test]
    fn test_register_assigns_sequential_pids() {
        let mut membership = Membership::new(5);
        assert_eq!(membership.register(test_addr(9001), "a"), Registration::New(Pid(1)));
        assert_eq!(membership.register(test_addr(9002), "b"), Registration::New(Pid(2)));
        assert_eq!(membership.len(), 2);
        assert!(membership.is_alive(Pid(2)));
    }

    #[test]
    fn test_register_is_idempotent_per_address() {
        let mut membership = Membership::new(5);
        membership.register(test_addr(9001), "a");
        let again = membership.register(test_addr(9001), "a");

        assert_eq!(again, Registration::Known(Pid(1)));
        assert_eq!(again.pid(), Pid(1));
        assert_eq!(membership.len(), 1);
    }

    #[test]
    fn test_grace_drops_after_max_missed() {
        let mut membership = three_players();

        assert!(!membership.count_grace(Pid(2)));
        assert!(!membership.count_grace(Pid(2)));
        assert!(membership.count_grace(Pid(2)));

        assert!(membership.is_dropped(Pid(2)));
        assert!(!membership.is_alive(Pid(2)));
        assert_eq!(membership.finish_order(), &[Pid(2)]);
        assert_eq!(membership.response_quorum(), 2);

        // Dropped players never count again
        assert!(!membership.count_grace(Pid(2)));
        assert_eq!(membership.get(Pid(2)).unwrap().grace, 3);
    }

    #[test]
    fn test_reset_grace() {
        let mut membership = three_players();
        membership.count_grace(Pid(1));
        membership.count_grace(Pid(1));
        membership.reset_grace(Pid(1));
        assert_eq!(membership.get(Pid(1)).unwrap().grace, 0);
        assert!(!membership.count_grace(Pid(1)));
    }

    #[test]
    fn test_kill_only_once() {
        let mut membership = three_players();
        assert!(membership.kill(Pid(3)));
        assert!(!membership.kill(Pid(3)));
        assert!(!membership.kill(Pid(42)));
        assert_eq!(membership.finish_order(), &[Pid(3)]);
    }

    #[test]
    fn test_game_over_and_finish_order() {
        let mut membership = three_players();
        membership.kill(Pid(2));
        assert!(!membership.is_game_over(false));

        membership.kill(Pid(1));
        assert!(membership.is_game_over(false));
        assert!(!membership.is_game_over(true));

        membership.crown_survivors();
        membership.crown_survivors();
        assert_eq!(membership.finish_order(), &[Pid(2), Pid(1), Pid(3)]);
    }

    #[test]
    fn test_from_roster() {
        let membership = three_players();
        let rebuilt = Membership::from_roster(
            &membership.address_book(),
            &membership.nicknames(),
            3,
        )
        .unwrap();

        assert_eq!(rebuilt.pids(), vec![Pid(1), Pid(2), Pid(3)]);
        assert_eq!(rebuilt.pid_for(test_addr(9002)), Some(Pid(2)));
        assert_eq!(rebuilt.get(Pid(3)).unwrap().nickname, "c");
        assert_eq!(rebuilt.response_quorum(), 3);

        let mut rebuilt = rebuilt;
        assert_eq!(rebuilt.register(test_addr(9004), "d"), Registration::New(Pid(4)));
    }

    #[test]
    fn test_from_roster_rejects_bad_address() {
        let mut addresses = BTreeMap::new();
        addresses.insert("nowhere".to_string(), Pid(1));
        assert!(matches!(
            Membership::from_roster(&addresses, &BTreeMap::new(), 5),
            Err(SessionError::BadAddress(_))
        ));
    }
}
