//! Bully-style leader election.
//!
//! A follower that stops hearing from its leader broadcasts `checkleader` to
//! every player and tallies `leaderdead` votes for a bounded window. Each
//! voter promises its vote to one candidate per epoch, and candidates yield to
//! lower pids, so at most one candidate normally collects a majority. The
//! winner bumps the epoch; `newleader` announcements with an epoch that is not
//! strictly newer are ignored everywhere.

use log::{debug, info, warn};
use shared::net::broadcast;
use shared::wire::{Ballot, Message};
use shared::{Epoch, Pid, Round};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Normal,
    /// An election of ours is in flight.
    Quorum,
    /// We won and are standing up a coordinator.
    NewLeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    Won,
    Lost,
    /// Someone answered with a newer epoch.
    Superseded,
    /// The follower dropped the tally channel.
    Cancelled,
}

/// A vote handed to a candidate for one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Promise {
    pub epoch: Epoch,
    pub candidate: Pid,
    pub at: Instant,
}

/// How to answer a `checkleader`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// `leaderalive`: the claim is stale or the vote belongs to someone else.
    Alive,
    /// `leaderdead` for our own election.
    SelfVote,
    /// `leaderdead`, promising the vote to the sender.
    Promise,
    /// `leaderdead`; a lower pid is also running, so abandon our election.
    Yield,
}

impl Vote {
    pub fn reply(self, ballot: Ballot) -> Message {
        match self {
            Vote::Alive => Message::LeaderAlive(ballot),
            Vote::SelfVote | Vote::Promise | Vote::Yield => Message::LeaderDead(ballot),
        }
    }
}

/// What a follower knows when it judges a `checkleader`.
#[derive(Debug, Clone, Copy)]
pub struct Voter {
    pub pid: Pid,
    pub round: Round,
    pub epoch: Epoch,
    pub state: ElectionState,
    pub promised: Option<Promise>,
    /// How long a promise binds.
    pub window: Duration,
}

pub fn judge_check(voter: &Voter, claim: Ballot, sender: Pid, now: Instant) -> Vote {
    if voter.round > claim.round || voter.epoch > claim.leader_id {
        return Vote::Alive;
    }

    if sender == voter.pid {
        return Vote::SelfVote;
    }

    if voter.state == ElectionState::Quorum {
        return if sender < voter.pid {
            Vote::Yield
        } else {
            Vote::Alive
        };
    }

    match voter.promised {
        Some(promise)
            if promise.epoch == claim.leader_id
                && promise.candidate != sender
                && now.duration_since(promise.at) < voter.window =>
        {
            Vote::Alive
        }
        _ => Vote::Promise,
    }
}

/// Handle on the election task a follower is running.
pub struct ActiveElection {
    pub ballot: Ballot,
    replies: mpsc::Sender<Message>,
    handle: JoinHandle<ElectionOutcome>,
}

impl ActiveElection {
    pub fn start(
        socket: Arc<UdpSocket>,
        ballot: Ballot,
        peers: Vec<SocketAddr>,
        window: Duration,
    ) -> Self {
        let (replies, tally) = mpsc::channel((peers.len() * 2).max(8));
        let handle = tokio::spawn(run_election(socket, ballot, peers, window, tally));
        Self {
            ballot,
            replies,
            handle,
        }
    }

    /// Hands a `leaderalive`/`leaderdead` reply to the tally.
    pub fn record(&self, reply: Message) {
        if let Err(e) = self.replies.try_send(reply) {
            debug!(target: "election", "Tally did not take a reply: {}", e);
        }
    }

    /// Resolves when the tally finishes.
    pub async fn outcome(&mut self) -> ElectionOutcome {
        match (&mut self.handle).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(target: "election", "Election task failed: {}", e);
                ElectionOutcome::Cancelled
            }
        }
    }
}

/// Broadcasts `checkleader` and counts votes until `window` elapses.
pub async fn run_election(
    socket: Arc<UdpSocket>,
    ballot: Ballot,
    peers: Vec<SocketAddr>,
    window: Duration,
    mut tally: mpsc::Receiver<Message>,
) -> ElectionOutcome {
    info!(
        target: "election",
        "Checking leader at round {} epoch {} with {} peers",
        ballot.round,
        ballot.leader_id,
        peers.len()
    );

    if let Err(e) = broadcast(&socket, &Message::CheckLeader(ballot), peers).await {
        warn!(target: "election", "Could not send checkleader: {}", e);
        return ElectionOutcome::Lost;
    }

    let deadline = Instant::now() + window;
    let mut received = 0usize;
    let mut positive = 0usize;

    loop {
        let reply = match timeout_at(deadline, tally.recv()).await {
            Err(_) => break,
            Ok(None) => {
                debug!(target: "election", "Election for epoch {} abandoned", ballot.leader_id);
                return ElectionOutcome::Cancelled;
            }
            Ok(Some(reply)) => reply,
        };

        let Some(vote) = reply.ballot() else {
            continue;
        };

        if vote.leader_id > ballot.leader_id {
            info!(target: "election", "A peer already follows epoch {}", vote.leader_id);
            return ElectionOutcome::Superseded;
        }

        received += 1;
        if matches!(reply, Message::LeaderDead(_)) && vote.round >= ballot.round {
            positive += 1;
        }
    }

    info!(
        target: "election",
        "Tally for epoch {}: {} of {} say the leader is dead",
        ballot.leader_id,
        positive,
        received
    );

    if 2 * positive > received {
        ElectionOutcome::Won
    } else {
        ElectionOutcome::Lost
    }
}
