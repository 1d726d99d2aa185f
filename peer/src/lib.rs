//! # Peer Library
//!
//! Everything one player's process runs besides the coordinator itself. A
//! peer follows the current leader in lock-step, relays each round to its
//! decision process, and keeps a mirror of the leader's position window so
//! that it can become the leader if the current one disappears.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! The [`network::Follower`] loop: joining, answering rounds, mirroring
//! results, judging other peers' elections and promoting itself.
//!
//! ### Election Module (`election`)
//! The vote rules and the tally task used to replace a silent leader.
//!
//! ### Relay Module (`relay`)
//! The two single-slot queues between the follower and its decider, and the
//! TCP line protocol spoken with an external game engine.
//!
//! ### AI Module (`ai`)
//! A built-in decider that avoids walls and trails.

pub mod ai;
pub mod election;
pub mod network;
pub mod relay;
