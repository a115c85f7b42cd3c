//! Persistent worker threads of the mixer pool
//!
//! A worker thread loops forever around two rendezvous points: it waits for
//! a phase it has not seen yet, drains the shared peer queue running that
//! phase's job, then reports back to the pool. A worker flagged to stop
//! reports itself as stopped at its next rendezvous and exits instead of
//! picking up work.

use crate::job::{self, Job, MixJobs};
use crate::stats::WorkerStats;
use log::{debug, error, warn};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// The only view of the pool a worker thread gets.
pub(crate) trait Rendezvous<P>: Send + Sync {
    /// Blocks until a phase newer than `last_phase` starts and this worker
    /// is admitted to it. Returns the phase's job, or `None` for an empty
    /// cycle driven by a shrink.
    fn wait(&self, last_phase: &mut u64) -> Option<Job<P>>;

    /// Reports that this worker drained the queue for its current phase.
    fn notify(&self, stopping: bool);

    fn try_pop(&self) -> Option<P>;
}

/// Per-thread state handed to every job the thread runs.
#[derive(Debug, Default)]
pub struct Worker {
    id: usize,
    stats: WorkerStats,
}

impl Worker {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            stats: WorkerStats::default(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut WorkerStats {
        &mut self.stats
    }

    /// Returns the stats gathered since the last harvest and resets them.
    pub fn harvest_stats(&mut self) -> WorkerStats {
        self.stats.harvest()
    }
}

/// A `Worker` bound to an OS thread.
pub(crate) struct WorkerThread {
    id: usize,
    stop: Arc<AtomicBool>,
    worker: Arc<Mutex<Worker>>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    /// Starts a thread that will join the first phase after `current_phase`.
    pub(crate) fn spawn<M, R>(
        id: usize,
        jobs: Arc<M>,
        pool: Arc<R>,
        current_phase: u64,
    ) -> std::io::Result<Self>
    where
        M: MixJobs,
        R: Rendezvous<M::Peer> + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let worker = Arc::new(Mutex::new(Worker::new(id)));

        let handle = {
            let stop = Arc::clone(&stop);
            let worker = Arc::clone(&worker);
            thread::Builder::new()
                .name(format!("mixer-worker-{}", id))
                .spawn(move || run_loop(jobs, pool, worker, stop, current_phase))?
        };

        Ok(Self {
            id,
            stop,
            worker,
            handle: Some(handle),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub(crate) fn lock_worker(&self) -> MutexGuard<'_, Worker> {
        lock_worker(&self.worker)
    }

    /// Joins the thread, giving up after `timeout`.
    ///
    /// Returns false if the thread had to be detached.
    pub(crate) fn join_timeout(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    "Mixer worker {} did not exit within {:?}; detaching",
                    self.id, timeout
                );
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }

        if handle.join().is_err() {
            warn!("Mixer worker {} panicked while exiting", self.id);
        }
        true
    }
}

fn run_loop<M, R>(
    jobs: Arc<M>,
    pool: Arc<R>,
    worker: Arc<Mutex<Worker>>,
    stop: Arc<AtomicBool>,
    mut last_phase: u64,
) where
    M: MixJobs,
    R: Rendezvous<M::Peer>,
{
    let id = lock_worker(&worker).id();
    debug!("Mixer worker {} started", id);

    loop {
        let job = pool.wait(&mut last_phase);
        let stopping = stop.load(Ordering::SeqCst);

        if let (false, Some(job)) = (stopping, job) {
            let mut worker = lock_worker(&worker);
            while let Some(peer) = pool.try_pop() {
                run_guarded(&*jobs, &mut worker, &job, &peer);
            }
        }

        pool.notify(stopping);
        if stopping {
            break;
        }
    }

    debug!("Mixer worker {} exiting", id);
}

/// Runs one job, containing any panic to this peer so the barrier still completes.
fn run_guarded<M: MixJobs>(jobs: &M, worker: &mut Worker, job: &Job<M::Peer>, peer: &M::Peer) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| job::run(jobs, worker, job, peer)));
    if outcome.is_err() {
        worker.stats.job_faults += 1;
        error!(
            "Mixer worker {}: {} job panicked; peer skipped this phase",
            worker.id,
            job.name()
        );
    }
}

fn lock_worker(worker: &Mutex<Worker>) -> MutexGuard<'_, Worker> {
    worker.lock().unwrap_or_else(PoisonError::into_inner)
}
