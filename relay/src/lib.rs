//! # Presence Relay Library
//!
//! This library provides the server side of a real-time presence relay.
//! Every connected peer publishes its own presence (position, motion, size)
//! many times a second; every frame the relay sends each peer a
//! bandwidth-bounded view of everyone else.
//!
//! ## Frame Structure
//!
//! A frame runs in two phases, each fanned out over a persistent worker pool
//! and joined before the next begins:
//!
//! 1. **Ingest**: each peer's buffered updates are validated and the newest
//!    one becomes its current presence.
//! 2. **Broadcast**: for each listener, the other peers are ranked, the
//!    listener's per-frame byte budget is split between them, and the result
//!    is encoded into as few datagrams as fit.
//!
//! Because ingest finishes before broadcast starts, every broadcast job reads
//! a stable snapshot of every peer's presence.
//!
//! ## Module Organization
//!
//! ### Worker Pool (`pool`, `worker`, `job`)
//! - Fan-out, barrier, fan-in over a shared queue of peers
//! - Phase gating so no worker joins a phase twice
//! - Resizing at runtime, with bounded joins when shrinking
//! - Per-peer fault containment
//!
//! ### Mixing (`mixer`, `budget`)
//! - The ingest and broadcast jobs
//! - Continuous bandwidth allocation with a reserve for priority sources
//!
//! ### Relay (`network`, `peer`, `throttle`, `config`, `stats`)
//! - UDP receive and send tasks and the frame loop
//! - Peer lifecycle and per-peer state
//! - Load-driven throttling of every peer's budget
//! - JSON settings and per-worker counters
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use relay::config::MixerSettings;
//! use relay::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let mut server = Server::new("127.0.0.1:8080", MixerSettings::default(), None).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! The pool can also be driven directly with any [`job::MixJobs`]
//! implementation:
//!
//! ```rust,no_run
//! use relay::job::{BroadcastFrame, MixJobs};
//! use relay::pool::WorkerPool;
//! use relay::worker::Worker;
//! use std::time::Instant;
//!
//! struct Count;
//!
//! impl MixJobs for Count {
//!     type Peer = u32;
//!     fn process_incoming(&self, worker: &mut Worker, _peer: &u32) {
//!         worker.stats_mut().peers_processed += 1;
//!     }
//!     fn broadcast(&self, worker: &mut Worker, _listener: &u32, _frame: &BroadcastFrame<u32>) {
//!         worker.stats_mut().listeners_broadcast_to += 1;
//!     }
//! }
//!
//! let mut pool = WorkerPool::with_threads(Count, 4).unwrap();
//! let peers: Vec<u32> = (1..=100).collect();
//! pool.process_incoming(&peers);
//! pool.broadcast(&peers, Instant::now(), 5000.0, 1.0);
//! ```

pub mod budget;
pub mod config;
pub mod job;
pub mod mixer;
pub mod network;
pub mod peer;
pub mod pool;
pub mod stats;
pub mod throttle;
pub mod utils;
pub mod worker;

pub use budget::BudgetParams;
pub use config::MixerSettings;
pub use job::{BroadcastFrame, Job, MixJobs};
pub use mixer::PresenceMixer;
pub use pool::{PoolError, WorkerPool};
pub use stats::WorkerStats;
pub use worker::Worker;
