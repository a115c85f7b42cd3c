//! Counters each worker accumulates while running jobs
//!
//! Workers own their stats exclusively during a phase; the frame driver
//! harvests and aggregates them between phases through `WorkerPool::each`.

use std::ops::AddAssign;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerStats {
    // ingest
    pub peers_processed: u64,
    pub packets_processed: u64,
    pub stale_updates: u64,
    pub malformed_updates: u64,

    // broadcast
    pub listeners_broadcast_to: u64,
    pub sources_included: u64,
    pub priority_sources_included: u64,
    pub minimal_sources_included: u64,
    pub over_budget_sources: u64,
    pub held_back_sources: u64,
    pub ignored_sources: u64,
    pub skipped_frames: u64,
    /// Wire bytes, datagram framing included
    pub data_bytes_sent: u64,
    pub datagrams_sent: u64,

    pub job_faults: u64,
    pub ingest_elapsed: Duration,
    pub broadcast_elapsed: Duration,
}

impl WorkerStats {
    /// Returns the accumulated counters and resets them.
    pub fn harvest(&mut self) -> WorkerStats {
        std::mem::take(self)
    }

    /// Average number of sources sent to each listener.
    pub fn average_sources_per_listener(&self) -> f32 {
        if self.listeners_broadcast_to == 0 {
            return 0.0;
        }
        self.sources_included as f32 / self.listeners_broadcast_to as f32
    }
}

impl AddAssign<&WorkerStats> for WorkerStats {
    fn add_assign(&mut self, other: &WorkerStats) {
        self.peers_processed += other.peers_processed;
        self.packets_processed += other.packets_processed;
        self.stale_updates += other.stale_updates;
        self.malformed_updates += other.malformed_updates;
        self.listeners_broadcast_to += other.listeners_broadcast_to;
        self.sources_included += other.sources_included;
        self.priority_sources_included += other.priority_sources_included;
        self.minimal_sources_included += other.minimal_sources_included;
        self.over_budget_sources += other.over_budget_sources;
        self.held_back_sources += other.held_back_sources;
        self.ignored_sources += other.ignored_sources;
        self.skipped_frames += other.skipped_frames;
        self.data_bytes_sent += other.data_bytes_sent;
        self.datagrams_sent += other.datagrams_sent;
        self.job_faults += other.job_faults;
        self.ingest_elapsed += other.ingest_elapsed;
        self.broadcast_elapsed += other.broadcast_elapsed;
    }
}
