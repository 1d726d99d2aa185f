//! # Round Coordinator Library
//!
//! This library provides the authoritative leader for a lock-step multiplayer
//! session. Exactly one process leads at a time; it owns the canonical player
//! positions and tells every follower what happened in each round.
//!
//! ## Core Responsibilities
//!
//! ### Lobby
//! Players join with `JOIN:<nickname>` and get sequential pids and random
//! starting positions. `START` from the leader-elect, or a quiet lobby, closes
//! registration and sends each player its own `gameStart`.
//!
//! ### Lock-Step Rounds
//! Each round the coordinator broadcasts `roundstart`, collects at most one
//! move per player until a deadline, resolves the moves on the grid, and
//! broadcasts the resulting position window. Nobody advances until the
//! leader says so.
//!
//! ### Stragglers and Deaths
//! Players that miss a round keep moving in their last direction and count a
//! missed round; too many in a row and they are dropped. With collisions
//! enabled, stepping into a wall or any trail kills the player and a
//! `killplayer` goes out immediately.
//!
//! ## Module Organization
//!
//! ### Membership Module (`membership`)
//! Registration, alive/dead status, grace counters and the finish order.
//!
//! ### Game Module (`game`)
//! The authoritative round state: grid, position history and move rules,
//! plus the [`game::Handoff`] a follower builds when it takes over.
//!
//! ### Network Module (`network`)
//! The [`network::Coordinator`] that drives the lobby and round loop over UDP.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use leader::network::Coordinator;
//! use shared::SessionConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), shared::SessionError> {
//!     let coordinator = Coordinator::bind(
//!         "127.0.0.1:4000",
//!         80,
//!         60,
//!         SessionConfig::default(),
//!     )
//!     .await?;
//!
//!     let finish = coordinator.run().await?;
//!     println!("finish order: {:?}", finish);
//!     Ok(())
//! }
//! ```

pub mod game;
pub mod membership;
pub mod network;
