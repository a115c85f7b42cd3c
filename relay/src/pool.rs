//! Elastic worker pool driving the per-tick ingest and broadcast phases
//!
//! Each dispatch is a fan-out / barrier / fan-in cycle:
//! 1. every peer of the tick is pushed onto one shared FIFO
//! 2. the phase's job is published and the phase counter advanced
//! 3. all workers are woken and admitted to the phase exactly once
//! 4. the caller blocks until every worker has drained the queue
//!
//! Peers are not pre-assigned to workers, so uneven per-peer cost balances
//! itself across the pool.
//!
//! Two counters track a phase. `num_started` counts workers that observed
//! the new phase and took its job; `num_finished` counts workers that
//! drained the queue for it. Shrinking reuses the same barrier: workers past
//! the new size are flagged, then empty cycles are driven until every
//! flagged worker has seen its flag and counted itself in `num_stopped`.
//!
//! All mutating operations take `&mut self`, so a resize can never overlap
//! an in-flight dispatch.

use crate::budget::{clamp_unit, BudgetParams, DEFAULT_PRIORITY_RESERVED_FRACTION};
use crate::job::{BroadcastFrame, Job, MixJobs};
use crate::worker::{Rendezvous, Worker, WorkerThread};
use crossbeam::queue::SegQueue;
use log::{debug, info, warn};
use std::num::NonZeroUsize;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Thread count used when hardware concurrency cannot be detected.
pub const FALLBACK_CONCURRENCY: usize = 4;

const MAX_THREAD_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Failed to spawn mixer worker {id}: {source}")]
    Spawn {
        id: usize,
        #[source]
        source: std::io::Error,
    },
}

/// Hardware concurrency, or `FALLBACK_CONCURRENCY` when unavailable.
pub fn detected_concurrency() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(FALLBACK_CONCURRENCY)
}

/// Snapshot of the barrier bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounters {
    pub num_threads: usize,
    pub num_started: usize,
    pub num_finished: usize,
    pub num_stopped: usize,
}

impl PoolCounters {
    /// True between dispatches.
    pub fn is_at_rest(&self) -> bool {
        self.num_started == self.num_threads && self.num_finished == self.num_threads
    }
}

struct PoolState<P> {
    num_threads: usize,
    num_started: usize,
    num_finished: usize,
    num_stopped: usize,
    phase: u64,
    job: Option<Job<P>>,
}

struct PoolShared<P> {
    queue: SegQueue<P>,
    state: Mutex<PoolState<P>>,
    worker_ready: Condvar,
    pool_done: Condvar,
}

impl<P> PoolShared<P> {
    fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            state: Mutex::new(PoolState {
                num_threads: 0,
                num_started: 0,
                num_finished: 0,
                num_stopped: 0,
                phase: 0,
                job: None,
            }),
            worker_ready: Condvar::new(),
            pool_done: Condvar::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<P>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wakes every worker and blocks until `num_finished` reaches `num_threads`.
    fn run_phase<'a>(&'a self, state: MutexGuard<'a, PoolState<P>>) -> MutexGuard<'a, PoolState<P>> {
        self.worker_ready.notify_all();
        self.pool_done
            .wait_while(state, |s| s.num_finished < s.num_threads)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P: Clone + Send + Sync> Rendezvous<P> for PoolShared<P> {
    fn wait(&self, last_phase: &mut u64) -> Option<Job<P>> {
        let seen = *last_phase;
        let mut state = self
            .worker_ready
            .wait_while(self.lock_state(), |s| {
                s.phase == seen || s.num_started >= s.num_threads
            })
            .unwrap_or_else(PoisonError::into_inner);

        state.num_started += 1;
        *last_phase = state.phase;
        state.job.clone()
    }

    fn notify(&self, stopping: bool) {
        {
            let mut state = self.lock_state();
            state.num_finished += 1;
            if stopping {
                state.num_stopped += 1;
            }
        }
        self.pool_done.notify_one();
    }

    fn try_pop(&self) -> Option<P> {
        self.queue.pop()
    }
}

/// Worker pool running `M`'s jobs over every peer of a tick.
pub struct WorkerPool<M: MixJobs> {
    shared: Arc<PoolShared<M::Peer>>,
    jobs: Arc<M>,
    workers: Vec<WorkerThread>,
    next_worker_id: usize,
    max_threads: usize,
    priority_reserved_fraction: f32,
}

impl<M: MixJobs> WorkerPool<M> {
    /// Creates a pool sized to the detected hardware concurrency.
    pub fn new(jobs: M) -> Result<Self, PoolError> {
        Self::with_threads(jobs, detected_concurrency())
    }

    /// Creates a pool of `num_threads` workers, clamped to the detected
    /// hardware concurrency.
    pub fn with_threads(jobs: M, num_threads: usize) -> Result<Self, PoolError> {
        Self::with_limit(jobs, num_threads, detected_concurrency())
    }

    /// Creates a pool of `num_threads` workers that may never grow past `max_threads`.
    pub(crate) fn with_limit(jobs: M, num_threads: usize, max_threads: usize) -> Result<Self, PoolError> {
        let mut pool = Self {
            shared: Arc::new(PoolShared::new()),
            jobs: Arc::new(jobs),
            workers: Vec::new(),
            next_worker_id: 0,
            max_threads: max_threads.max(1),
            priority_reserved_fraction: DEFAULT_PRIORITY_RESERVED_FRACTION,
        };
        pool.set_num_threads(num_threads)?;
        Ok(pool)
    }

    pub fn jobs(&self) -> &M {
        &self.jobs
    }

    /// Runs the ingest job once for every peer. Blocks until all are done.
    pub fn process_incoming(&mut self, peers: &[M::Peer]) {
        self.dispatch(peers, Job::ProcessIncoming);
    }

    /// Runs the broadcast job once for every peer. Blocks until all are done.
    pub fn broadcast(
        &mut self,
        peers: &[M::Peer],
        last_frame_timestamp: Instant,
        max_kbps_per_peer: f32,
        throttling_ratio: f32,
    ) {
        let frame = BroadcastFrame {
            peers: peers.into(),
            last_frame_timestamp,
            budget: BudgetParams::new(
                self.priority_reserved_fraction,
                max_kbps_per_peer,
                throttling_ratio,
            ),
        };
        self.dispatch(peers, Job::Broadcast(Arc::new(frame)));
    }

    fn dispatch(&mut self, peers: &[M::Peer], job: Job<M::Peer>) {
        for peer in peers {
            self.shared.queue.push(peer.clone());
        }

        let mut state = self.shared.lock_state();
        state.job = Some(job);
        state.num_started = 0;
        state.num_finished = 0;
        state.phase += 1;

        let mut state = self.shared.run_phase(state);
        state.job = None;
        drop(state);

        debug_assert!(
            self.shared.queue.is_empty(),
            "peer queue not drained after dispatch"
        );
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Clamps `requested` into `[1, max_threads]` and resizes to it.
    pub fn set_num_threads(&mut self, requested: usize) -> Result<(), PoolError> {
        let clamped = requested.clamp(1, self.max_threads);
        if clamped != requested {
            warn!(
                "Requested {} mixer threads; clamped to {} (allowed 1..={})",
                requested, clamped, self.max_threads
            );
        }
        self.resize(clamped)
    }

    fn resize(&mut self, num_threads: usize) -> Result<(), PoolError> {
        let current = self.workers.len();
        let result = if num_threads > current {
            self.grow(num_threads)
        } else {
            if num_threads < current {
                self.shrink(num_threads);
            }
            Ok(())
        };

        let live = self.workers.len();
        let mut state = self.shared.lock_state();
        state.num_threads = live;
        state.num_started = live;
        state.num_finished = live;
        state.num_stopped = 0;
        drop(state);

        if live != current {
            info!("Mixer pool resized from {} to {} threads", current, live);
        }
        result
    }

    fn grow(&mut self, num_threads: usize) -> Result<(), PoolError> {
        let phase = self.shared.lock_state().phase;
        while self.workers.len() < num_threads {
            let id = self.next_worker_id;
            self.next_worker_id += 1;

            let thread = WorkerThread::spawn(
                id,
                Arc::clone(&self.jobs),
                Arc::clone(&self.shared),
                phase,
            )
            .map_err(|source| PoolError::Spawn { id, source })?;
            self.workers.push(thread);
        }
        Ok(())
    }

    fn shrink(&mut self, num_threads: usize) {
        let removing = self.workers.len() - num_threads;
        for worker in &self.workers[num_threads..] {
            worker.request_stop();
        }

        let mut state = self.shared.lock_state();
        state.job = None;
        state.num_stopped = 0;
        while state.num_stopped < removing {
            state.num_started = state.num_stopped;
            state.num_finished = state.num_stopped;
            state.phase += 1;
            state = self.shared.run_phase(state);
        }
        drop(state);

        for mut worker in self.workers.drain(num_threads..) {
            if worker.join_timeout(MAX_THREAD_WAIT) {
                debug!("Mixer worker {} joined", worker.id());
            }
        }
    }

    pub fn set_priority_reserved_fraction(&mut self, fraction: f32) {
        let clamped = clamp_unit(fraction);
        if clamped != fraction {
            warn!(
                "Priority reserved fraction {} out of range; using {}",
                fraction, clamped
            );
        }
        self.priority_reserved_fraction = clamped;
    }

    pub fn priority_reserved_fraction(&self) -> f32 {
        self.priority_reserved_fraction
    }

    /// Visits every live worker. Only meaningful between dispatches.
    pub fn each<F>(&self, mut functor: F)
    where
        F: FnMut(&mut Worker),
    {
        for thread in &self.workers {
            functor(&mut thread.lock_worker());
        }
    }

    pub fn counters(&self) -> PoolCounters {
        let state = self.shared.lock_state();
        PoolCounters {
            num_threads: state.num_threads,
            num_started: state.num_started,
            num_finished: state.num_finished,
            num_stopped: state.num_stopped,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }
}

impl<M: MixJobs> Drop for WorkerPool<M> {
    fn drop(&mut self) {
        // Shrinking never spawns, so this cannot fail
        let _ = self.resize(0);
    }
}
