//! Presence mixing jobs run by the worker pool
//!
//! Ingest applies the updates each peer sent since the last tick. Broadcast
//! builds, for one listener, a bandwidth-bounded view of every other peer:
//! sources already up to date or ignored are held back, the rest are ranked
//! and given a share of the listener's budget, and each one is encoded at
//! whatever detail its share affords. Datagram framing is paid out of the
//! same budget, so the bytes on the wire never exceed the ceiling.

use crate::budget::{self, Demand};
use crate::config::MixerSettings;
use crate::job::{BroadcastFrame, MixJobs};
use crate::network::OutboundMessage;
use crate::peer::Peer;
use crate::utils::get_timestamp;
use crate::worker::Worker;
use log::{debug, warn};
use shared::{Packet, PresenceEntry, PresenceState, Vec3, MAX_PAYLOAD_BYTES};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;

const SIZE_WEIGHT: f32 = 1.0;
const AGE_WEIGHT: f32 = 0.5;
const MIN_DISTANCE: f32 = 1.0;
/// Age assumed for a source this listener has never been sent.
const NEVER_SENT_AGE_SECS: f32 = 1.0;

/// How much a listener should care about a source this frame.
///
/// Larger, closer sources rank higher, and a source's rank grows the longer
/// it goes without being sent so that starved sources eventually get through.
pub fn relevance(
    listener: &PresenceState,
    source: &PresenceState,
    last_sent_at: Option<Instant>,
    last_frame_timestamp: Instant,
) -> f32 {
    let distance = listener.position.distance(&source.position).max(MIN_DISTANCE);
    let apparent_size = source.radius / distance;
    let age = match last_sent_at {
        Some(at) => last_frame_timestamp.saturating_duration_since(at).as_secs_f32(),
        None => NEVER_SENT_AGE_SECS,
    };
    SIZE_WEIGHT * apparent_size + AGE_WEIGHT * age
}

struct Candidate {
    entry: PresenceEntry,
    position: Vec3,
    full_len: usize,
    minimal_len: usize,
    priority: bool,
}

/// Splits entries into `BulkPresence` datagrams no larger than `MAX_PAYLOAD_BYTES`.
struct BulkPacker {
    timestamp: u64,
    overhead: usize,
    current: Vec<PresenceEntry>,
    current_len: usize,
    packets: Vec<Packet>,
}

impl BulkPacker {
    fn new(timestamp: u64) -> Self {
        let overhead = Packet::bulk_overhead();
        Self {
            timestamp,
            overhead,
            current: Vec::new(),
            current_len: overhead,
            packets: Vec::new(),
        }
    }

    /// Wire bytes that pushing an entry of `len` bytes would add.
    fn cost(&self, len: usize) -> usize {
        if self.opens_datagram(len) {
            self.overhead + len
        } else {
            len
        }
    }

    fn opens_datagram(&self, len: usize) -> bool {
        self.current.is_empty() || self.current_len + len > MAX_PAYLOAD_BYTES
    }

    fn push(&mut self, entry: PresenceEntry, len: usize) {
        if !self.current.is_empty() && self.current_len + len > MAX_PAYLOAD_BYTES {
            self.flush();
        }
        self.current_len += len;
        self.current.push(entry);
    }

    fn flush(&mut self) {
        let entries = std::mem::take(&mut self.current);
        self.current_len = self.overhead;
        self.packets.push(Packet::BulkPresence {
            timestamp: self.timestamp,
            entries,
        });
    }

    fn finish(mut self) -> Vec<Packet> {
        if !self.current.is_empty() {
            self.flush();
        }
        self.packets
    }
}

/// The relay's implementation of the per-peer jobs.
pub struct PresenceMixer {
    settings: MixerSettings,
    outbound: UnboundedSender<OutboundMessage>,
}

impl PresenceMixer {
    pub fn new(settings: MixerSettings, outbound: UnboundedSender<OutboundMessage>) -> Self {
        Self { settings, outbound }
    }

    pub fn settings(&self) -> &MixerSettings {
        &self.settings
    }

    fn is_priority(&self, state: &PresenceState) -> bool {
        (self.settings.allow_self_priority && state.wants_priority)
            || self.settings.in_priority_zone(&state.position)
    }

    fn send(&self, addr: SocketAddr, packet: Packet) {
        if let Err(e) = self.outbound.send(OutboundMessage::SendPacket { packet, addr }) {
            warn!("Failed to queue broadcast for {}: {}", addr, e);
        }
    }

    /// Sources worth sending to `listener` and what each asks for.
    ///
    /// Each demand's id is the index of its candidate.
    fn candidates(
        &self,
        listener: &Peer,
        frame: &BroadcastFrame<Arc<Peer>>,
        worker: &mut Worker,
    ) -> (Vec<Candidate>, Vec<Demand>) {
        let own = listener.presence().state.clone();
        let record = listener.listener();
        let mut candidates = Vec::new();
        let mut demands = Vec::new();

        for source in frame.peers.iter() {
            if source.id() == listener.id() {
                continue;
            }

            let presence = source.presence();
            if !presence.has_data() {
                continue;
            }

            if record.blocks(source.id()) {
                worker.stats_mut().ignored_sources += 1;
                continue;
            }

            let last_sent = record.last_sent(source.id());
            if let Some(sent) = last_sent {
                if sent.sequence == presence.sequence {
                    worker.stats_mut().held_back_sources += 1;
                    continue;
                }
                if presence.sequence.wrapping_sub(sent.sequence) > 1 {
                    worker.stats_mut().skipped_frames += 1;
                }
            }

            let entry = PresenceEntry::full(source.id(), presence.sequence, presence.state.clone());
            let minimal =
                PresenceEntry::minimal(source.id(), presence.sequence, presence.state.position);
            let full_len = entry.encoded_len();

            demands.push(Demand {
                id: candidates.len() as u32,
                amount: full_len as f32,
                priority: presence.has_priority,
                relevance: relevance(
                    &own,
                    &presence.state,
                    last_sent.map(|sent| sent.at),
                    frame.last_frame_timestamp,
                ),
            });
            candidates.push(Candidate {
                entry,
                position: presence.state.position,
                full_len,
                minimal_len: minimal.encoded_len(),
                priority: presence.has_priority,
            });
        }

        (candidates, demands)
    }
}

impl MixJobs for PresenceMixer {
    type Peer = Arc<Peer>;

    fn process_incoming(&self, worker: &mut Worker, peer: &Arc<Peer>) {
        let start = Instant::now();
        let updates = peer.take_inbound();
        let stats = worker.stats_mut();
        stats.peers_processed += 1;

        if !updates.is_empty() {
            let mut presence = peer.presence_mut();
            for update in updates {
                stats.packets_processed += 1;

                if update.sequence <= presence.sequence {
                    stats.stale_updates += 1;
                    debug!(
                        "Peer {}: stale update {} (have {})",
                        peer.id(),
                        update.sequence,
                        presence.sequence
                    );
                    continue;
                }

                if !update.state.is_valid() {
                    stats.malformed_updates += 1;
                    warn!(
                        "Peer {}: malformed presence in update {}; skipped",
                        peer.id(),
                        update.sequence
                    );
                    continue;
                }

                presence.sequence = update.sequence;
                presence.state = update.state;
            }
            presence.has_priority = self.is_priority(&presence.state);
        }

        stats.ingest_elapsed += start.elapsed();
    }

    fn broadcast(&self, worker: &mut Worker, listener: &Arc<Peer>, frame: &BroadcastFrame<Arc<Peer>>) {
        let start = Instant::now();
        worker.stats_mut().listeners_broadcast_to += 1;

        let (candidates, demands) = self.candidates(listener, frame, worker);

        let mut packer = BulkPacker::new(get_timestamp());
        let ceiling = frame.budget.ceiling_bytes_per_frame(self.settings.broadcast_rate);
        // The first datagram's framing comes off the top; later ones are
        // charged as they open.
        let allocation = budget::allocate(
            &demands,
            (ceiling - packer.overhead as f32).max(0.0),
            frame.budget.priority_reserved_fraction,
        );

        let mut remaining = ceiling;
        let mut record = listener.listener();
        let stats = worker.stats_mut();

        for grant in &allocation.grants {
            let Some(candidate) = candidates.get(grant.id as usize) else {
                continue;
            };
            let peer_id = candidate.entry.peer_id;
            let fits = |len: usize| grant.amount >= len as f32 && packer.cost(len) as f32 <= remaining;

            let (entry, len) = if fits(candidate.full_len) {
                (candidate.entry.clone(), candidate.full_len)
            } else if fits(candidate.minimal_len) {
                stats.minimal_sources_included += 1;
                (
                    PresenceEntry::minimal(peer_id, candidate.entry.sequence, candidate.position),
                    candidate.minimal_len,
                )
            } else {
                stats.over_budget_sources += 1;
                continue;
            };

            let cost = packer.cost(len);
            remaining -= cost as f32;
            stats.sources_included += 1;
            if candidate.priority {
                stats.priority_sources_included += 1;
            }
            stats.data_bytes_sent += cost as u64;
            record.record_sent(peer_id, entry.sequence, start);
            packer.push(entry, len);
        }

        stats.over_budget_sources += (candidates.len() - allocation.grants.len()) as u64;
        drop(record);

        let packets = packer.finish();
        stats.datagrams_sent += packets.len() as u64;
        for packet in packets {
            self.send(listener.addr(), packet);
        }

        stats.broadcast_elapsed += start.elapsed();
    }
}
