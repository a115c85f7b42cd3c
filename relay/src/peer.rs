//! Connected peers and the per-peer state consulted while mixing
//!
//! This module handles the server-side bookkeeping of connected clients:
//! - Peer lifecycle (connect, disconnect, timeout) under a capacity limit
//! - Buffering of inbound presence updates until the next ingest phase
//! - The latest accepted presence of each peer
//! - Per-listener records of what has already been sent to whom
//! - Ignore pairs between peers
//!
//! Each piece of per-peer state sits behind its own lock, and each is
//! written in exactly one phase: inbound updates and ignore pairs by the
//! network task between ticks, presence by the ingest job, sent records by
//! that listener's broadcast job. A worker pool therefore never contends on
//! them in a way that could observe a half-applied update.

use log::{debug, info};
use shared::PresenceState;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Updates buffered per peer between ticks; older ones are dropped first.
pub const MAX_QUEUED_UPDATES: usize = 64;

/// A presence update as received, not yet applied.
#[derive(Debug, Clone)]
pub struct InboundUpdate {
    pub sequence: u32,
    pub state: PresenceState,
}

/// The latest presence accepted for a peer.
#[derive(Debug, Clone)]
pub struct PresenceSnapshot {
    /// Zero until the first update is accepted
    pub sequence: u32,
    pub state: PresenceState,
    pub has_priority: bool,
}

impl Default for PresenceSnapshot {
    fn default() -> Self {
        Self {
            sequence: 0,
            state: PresenceState::at(shared::Vec3::ZERO),
            has_priority: false,
        }
    }
}

impl PresenceSnapshot {
    pub fn has_data(&self) -> bool {
        self.sequence != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SentRecord {
    pub sequence: u32,
    pub at: Instant,
}

/// What one listener has been sent about every other peer, and who it
/// must not hear from.
#[derive(Debug, Default)]
pub struct ListenerState {
    sent: HashMap<u32, SentRecord>,
    ignoring: HashSet<u32>,
    ignored_by: HashSet<u32>,
}

impl ListenerState {
    pub fn last_sent(&self, source: u32) -> Option<SentRecord> {
        self.sent.get(&source).copied()
    }

    pub fn record_sent(&mut self, source: u32, sequence: u32, at: Instant) {
        self.sent.insert(source, SentRecord { sequence, at });
    }

    pub fn forget(&mut self, source: u32) {
        self.sent.remove(&source);
    }

    pub fn known_sources(&self) -> usize {
        self.sent.len()
    }

    /// True if either side of the pair has asked to ignore the other.
    pub fn blocks(&self, source: u32) -> bool {
        self.ignoring.contains(&source) || self.ignored_by.contains(&source)
    }

    pub fn is_ignoring(&self, source: u32) -> bool {
        self.ignoring.contains(&source)
    }

    fn set_ignoring(&mut self, source: u32, ignore: bool) {
        if ignore {
            self.ignoring.insert(source);
        } else {
            self.ignoring.remove(&source);
        }
    }

    fn set_ignored_by(&mut self, source: u32, ignore: bool) {
        if ignore {
            self.ignored_by.insert(source);
        } else {
            self.ignored_by.remove(&source);
        }
    }

    fn remove_source(&mut self, source: u32) {
        self.sent.remove(&source);
        self.ignoring.remove(&source);
        self.ignored_by.remove(&source);
    }
}

/// One connected client.
#[derive(Debug)]
pub struct Peer {
    id: u32,
    addr: SocketAddr,
    inbound: Mutex<VecDeque<InboundUpdate>>,
    presence: RwLock<PresenceSnapshot>,
    listener: Mutex<ListenerState>,
}

impl Peer {
    pub fn new(id: u32, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            inbound: Mutex::new(VecDeque::new()),
            presence: RwLock::new(PresenceSnapshot::default()),
            listener: Mutex::new(ListenerState::default()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Buffers an update for the next ingest phase.
    pub fn enqueue(&self, update: InboundUpdate) {
        let mut inbound = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
        if inbound.len() >= MAX_QUEUED_UPDATES {
            inbound.pop_front();
            debug!("Peer {} inbound queue full; dropped oldest update", self.id);
        }
        inbound.push_back(update);
    }

    /// Takes every buffered update, sorted by sequence.
    pub fn take_inbound(&self) -> Vec<InboundUpdate> {
        let mut updates: Vec<InboundUpdate> = std::mem::take(
            &mut *self.inbound.lock().unwrap_or_else(PoisonError::into_inner),
        )
        .into();
        // Sort by sequence to handle out-of-order packet delivery
        updates.sort_by_key(|u| u.sequence);
        updates
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn presence(&self) -> RwLockReadGuard<'_, PresenceSnapshot> {
        self.presence.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn presence_mut(&self) -> RwLockWriteGuard<'_, PresenceSnapshot> {
        self.presence.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn listener(&self) -> MutexGuard<'_, ListenerState> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct PeerEntry {
    peer: Arc<Peer>,
    last_seen: Instant,
}

/// All connected peers, indexed by id.
pub struct PeerSet {
    peers: HashMap<u32, PeerEntry>,
    next_peer_id: u32,
    max_peers: usize,
    timeout: Duration,
}

impl PeerSet {
    /// Peer ids start from 1 and are never reused.
    pub fn new(max_peers: usize, timeout: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            next_peer_id: 1,
            max_peers,
            timeout,
        }
    }

    /// Returns the new peer's id, or None at capacity.
    pub fn add_peer(&mut self, addr: SocketAddr) -> Option<u32> {
        if self.peers.len() >= self.max_peers {
            return None;
        }

        let peer_id = self.next_peer_id;
        self.next_peer_id += 1;

        info!("Peer {} connected from {}", peer_id, addr);
        self.peers.insert(
            peer_id,
            PeerEntry {
                peer: Arc::new(Peer::new(peer_id, addr)),
                last_seen: Instant::now(),
            },
        );

        Some(peer_id)
    }

    /// Removes a peer and every listener's record of it.
    pub fn remove_peer(&mut self, peer_id: &u32) -> bool {
        if self.peers.remove(peer_id).is_none() {
            return false;
        }

        for entry in self.peers.values() {
            entry.peer.listener().remove_source(*peer_id);
        }
        info!("Peer {} disconnected", peer_id);
        true
    }

    /// Starts or stops `ignorer` ignoring `ignored`, in both directions.
    ///
    /// Sent records of the pair are dropped either way, so a lifted ignore
    /// resends the current presence of both peers.
    pub fn set_ignore(&mut self, ignorer: u32, ignored: u32, ignore: bool) -> bool {
        if ignorer == ignored {
            return false;
        }
        let (Some(a), Some(b)) = (self.peers.get(&ignorer), self.peers.get(&ignored)) else {
            return false;
        };

        {
            let mut record = a.peer.listener();
            record.set_ignoring(ignored, ignore);
            record.forget(ignored);
        }
        {
            let mut record = b.peer.listener();
            record.set_ignored_by(ignorer, ignore);
            record.forget(ignorer);
        }

        debug!(
            "Peer {} {} peer {}",
            ignorer,
            if ignore { "ignores" } else { "no longer ignores" },
            ignored
        );
        true
    }

    /// Id and address of every connected peer except `peer_id`.
    pub fn others(&self, peer_id: u32) -> Vec<(u32, SocketAddr)> {
        self.peers
            .values()
            .filter(|entry| entry.peer.id != peer_id)
            .map(|entry| (entry.peer.id, entry.peer.addr))
            .collect()
    }

    pub fn find_peer_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.peers
            .iter()
            .find(|(_, entry)| entry.peer.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn get(&self, peer_id: u32) -> Option<Arc<Peer>> {
        self.peers.get(&peer_id).map(|entry| Arc::clone(&entry.peer))
    }

    /// Buffers an update and refreshes the peer's activity time.
    pub fn enqueue_update(&mut self, peer_id: u32, update: InboundUpdate) -> bool {
        match self.peers.get_mut(&peer_id) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                entry.peer.enqueue(update);
                true
            }
            None => false,
        }
    }

    /// Removes and returns peers silent for longer than the timeout.
    pub fn check_timeouts(&mut self) -> Vec<u32> {
        let timeout = self.timeout;
        let timed_out: Vec<u32> = self
            .peers
            .iter()
            .filter(|(_, entry)| entry.last_seen.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();

        for peer_id in &timed_out {
            self.remove_peer(peer_id);
        }

        timed_out
    }

    /// Stable, id-ordered handles to every peer for one tick.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<Arc<Peer>> = self
            .peers
            .values()
            .map(|entry| Arc::clone(&entry.peer))
            .collect();
        peers.sort_by_key(|peer| peer.id);
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, peer_id: u32, by: Duration) {
        if let Some(entry) = self.peers.get_mut(&peer_id) {
            entry.last_seen = Instant::now() - by;
        }
    }
}
