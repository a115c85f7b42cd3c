//! Job selection for a dispatch phase
//!
//! Exactly one job is active pool-wide per phase. The pool writes it once
//! before waking the workers; each worker clones it when it joins the phase
//! and keeps it locally until the queue is drained.

use crate::budget::BudgetParams;
use crate::worker::Worker;
use std::sync::Arc;
use std::time::Instant;

/// Everything a broadcast job needs besides the listener itself.
#[derive(Debug)]
pub struct BroadcastFrame<P> {
    /// Every peer in this tick, in stable order
    pub peers: Arc<[P]>,
    /// Start of the previous frame; anchors delta and age decisions
    pub last_frame_timestamp: Instant,
    pub budget: BudgetParams,
}

#[derive(Debug, Clone)]
pub enum Job<P> {
    ProcessIncoming,
    Broadcast(Arc<BroadcastFrame<P>>),
}

impl<P> Job<P> {
    pub fn name(&self) -> &'static str {
        match self {
            Job::ProcessIncoming => "process-incoming",
            Job::Broadcast(_) => "broadcast",
        }
    }
}

/// Per-peer job implementations run by the worker pool.
///
/// Both jobs may be called from any worker thread, but never concurrently
/// for the same peer within one phase. They are expected to log and skip bad
/// data rather than panic.
pub trait MixJobs: Send + Sync + 'static {
    type Peer: Clone + Send + Sync + 'static;

    /// Consumes the packets a peer sent since the last tick.
    fn process_incoming(&self, worker: &mut Worker, peer: &Self::Peer);

    /// Builds and sends `listener` its view of the other peers.
    fn broadcast(&self, worker: &mut Worker, listener: &Self::Peer, frame: &BroadcastFrame<Self::Peer>);
}

pub(crate) fn run<M: MixJobs>(jobs: &M, worker: &mut Worker, job: &Job<M::Peer>, peer: &M::Peer) {
    match job {
        Job::ProcessIncoming => jobs.process_incoming(worker, peer),
        Job::Broadcast(frame) => jobs.broadcast(worker, peer, frame),
    }
}
