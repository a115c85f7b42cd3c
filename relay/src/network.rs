//! Relay network layer handling UDP communications and the mix loop

use crate::config::MixerSettings;
use crate::mixer::PresenceMixer;
use crate::peer::{InboundUpdate, PeerSet};
use crate::pool::{detected_concurrency, WorkerPool};
use crate::stats::WorkerStats;
use crate::throttle::ThrottleController;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Packet, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::interval;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Messages sent from network tasks to the main relay loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    Shutdown,
}

/// Messages sent from the mix loop and workers to the sender task
#[derive(Debug)]
pub enum OutboundMessage {
    SendPacket { packet: Packet, addr: SocketAddr },
}

/// Thread count for a new pool: explicit override, then settings, then hardware.
pub fn pool_size(settings: &MixerSettings, threads_override: Option<usize>) -> usize {
    match threads_override {
        Some(threads) => threads,
        None if settings.auto_threads => detected_concurrency(),
        None => settings.num_threads,
    }
}

/// Main relay coordinating networking and the per-frame mix
pub struct Server {
    socket: Arc<UdpSocket>,
    peers: PeerSet,
    pool: WorkerPool<PresenceMixer>,
    throttle: ThrottleController,
    settings: MixerSettings,
    frame: u64,
    last_frame_timestamp: Instant,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: Option<mpsc::UnboundedReceiver<OutboundMessage>>,
}

impl Server {
    pub async fn new(
        addr: &str,
        settings: MixerSettings,
        threads_override: Option<usize>,
    ) -> Result<Self, BoxError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Relay listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let num_threads = pool_size(&settings, threads_override);
        let mixer = PresenceMixer::new(settings.clone(), outbound_tx.clone());
        let mut pool = WorkerPool::with_threads(mixer, num_threads)?;
        pool.set_priority_reserved_fraction(settings.priority_fraction);
        info!(
            "Mixing with {} threads, {:.1} Mbps per peer, {:.0}% reserved for priority sources",
            pool.num_threads(),
            settings.max_node_send_bandwidth,
            pool.priority_reserved_fraction() * 100.0
        );

        Ok(Server {
            socket,
            peers: PeerSet::new(settings.max_peers, settings.peer_timeout()),
            pool,
            throttle: ThrottleController::new(),
            settings,
            frame: 0,
            last_frame_timestamp: Instant::now(),
            server_tx,
            server_rx,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sender that stops `run` when given `ServerMessage::Shutdown`.
    pub fn control_handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn pool(&self) -> &WorkerPool<PresenceMixer> {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut WorkerPool<PresenceMixer> {
        &mut self.pool
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that drains the outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let Some(mut outbound_rx) = self.outbound_rx.take() else {
            return;
        };
        let socket = Arc::clone(&self.socket);

        tokio::spawn(async move {
            while let Some(OutboundMessage::SendPacket { packet, addr }) = outbound_rx.recv().await {
                if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                    error!("Failed to send packet to {}: {}", addr, e);
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), BoxError> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.outbound_tx.send(OutboundMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    /// Applies one client packet to the peer set.
    pub fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect { client_version } => {
                info!("Peer connecting from {} (version: {})", addr, client_version);

                if client_version != PROTOCOL_VERSION {
                    warn!(
                        "Rejecting {}: protocol version {} (expected {})",
                        addr, client_version, PROTOCOL_VERSION
                    );
                    self.send_packet(
                        Packet::Disconnected {
                            reason: "Protocol version mismatch".to_string(),
                        },
                        addr,
                    );
                    return;
                }

                // Remove existing connection if present
                if let Some(existing_id) = self.peers.find_peer_by_addr(addr) {
                    info!("Removing existing peer {} from {}", existing_id, addr);
                    self.remove_peer(existing_id);
                }

                let response = match self.peers.add_peer(addr) {
                    Some(peer_id) => Packet::Connected { peer_id },
                    None => Packet::Disconnected {
                        reason: "Relay full".to_string(),
                    },
                };
                self.send_packet(response, addr);
            }

            Packet::PresenceUpdate {
                sequence,
                timestamp: _,
                state,
            } => match self.peers.find_peer_by_addr(addr) {
                Some(peer_id) => {
                    self.peers.enqueue_update(
                        peer_id,
                        InboundUpdate { sequence, state },
                    );
                }
                None => debug!("Presence update from unknown address {}", addr),
            },

            Packet::Disconnect => {
                if let Some(peer_id) = self.peers.find_peer_by_addr(addr) {
                    self.remove_peer(peer_id);
                }
            }

            Packet::IgnoreRequest { peer_id, ignore } => {
                let Some(ignorer) = self.peers.find_peer_by_addr(addr) else {
                    debug!("Ignore request from unknown address {}", addr);
                    return;
                };
                if !self.peers.set_ignore(ignorer, peer_id, ignore) {
                    debug!("Peer {} cannot ignore unknown peer {}", ignorer, peer_id);
                    return;
                }
                if ignore {
                    if let Some(ignored) = self.peers.get(peer_id) {
                        self.send_packet(Packet::PeerLeft { peer_id: ignorer }, ignored.addr());
                    }
                }
            }

            _ => {
                warn!("Unexpected packet type from peer at {}", addr);
            }
        }
    }

    /// Removes a peer and tells everyone still connected that it left.
    fn remove_peer(&mut self, peer_id: u32) {
        if self.peers.remove_peer(&peer_id) {
            self.announce_departure(peer_id);
        }
    }

    fn announce_departure(&self, peer_id: u32) {
        for (_, addr) in self.peers.others(peer_id) {
            self.send_packet(Packet::PeerLeft { peer_id }, addr);
        }
    }

    /// Runs one frame: timeouts, ingest, broadcast, throttle and stats.
    ///
    /// Blocks the calling thread until every worker has finished both phases.
    pub fn mix_frame(&mut self) {
        let frame_start = Instant::now();

        for peer_id in self.peers.check_timeouts() {
            info!("Peer {} timed out", peer_id);
            self.announce_departure(peer_id);
        }

        let peers = self.peers.snapshot();
        if !peers.is_empty() {
            self.pool.process_incoming(&peers);
            self.pool.broadcast(
                &peers,
                self.last_frame_timestamp,
                self.settings.max_kbps_per_peer(),
                self.throttle.throttling_ratio(),
            );
        }

        self.last_frame_timestamp = frame_start;
        self.throttle
            .update(frame_start.elapsed(), self.settings.frame_duration());
        self.frame += 1;

        let stats_interval = self.settings.stats_interval_frames;
        if stats_interval > 0 && self.frame % stats_interval == 0 {
            self.log_stats();
        }
    }

    /// Harvests every worker's counters into one total.
    pub fn harvest_stats(&self) -> WorkerStats {
        let mut total = WorkerStats::default();
        self.pool.each(|worker| total += &worker.harvest_stats());
        total
    }

    fn log_stats(&self) {
        let stats = self.harvest_stats();
        info!(
            "Frame {}: {} peers, {} threads, throttle {:.2}, {:.1} sources/listener, {} bytes in {} datagrams",
            self.frame,
            self.peers.len(),
            self.pool.num_threads(),
            self.throttle.throttling_ratio(),
            stats.average_sources_per_listener(),
            stats.data_bytes_sent,
            stats.datagrams_sent
        );
        debug!(
            "Frame {}: {} priority, {} minimal, {} over budget, {} held back, {} skipped, {} stale, {} malformed, {} faults",
            self.frame,
            stats.priority_sources_included,
            stats.minimal_sources_included,
            stats.over_budget_sources,
            stats.held_back_sources,
            stats.skipped_frames,
            stats.stale_updates,
            stats.malformed_updates,
            stats.job_faults
        );
    }

    /// Main relay loop coordinating all operations
    ///
    /// Needs a multi-threaded runtime: each frame blocks inside `block_in_place`.
    pub async fn run(&mut self) -> Result<(), BoxError> {
        self.spawn_network_receiver();
        self.spawn_network_sender();

        let mut tick_interval = interval(self.settings.frame_duration());
        info!("Relay started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Relay shutting down");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    tokio::task::block_in_place(|| self.mix_frame());
                },
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{PresenceEntry, PresenceState, Vec3};
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn test_settings() -> MixerSettings {
        MixerSettings {
            auto_threads: false,
            num_threads: 2,
            max_peers: 3,
            stats_interval_frames: 0,
            ..Default::default()
        }
    }

    fn test_server() -> Server {
        tokio_test::block_on(Server::new("127.0.0.1:0", test_settings(), None)).unwrap()
    }

    fn drain(server: &mut Server) -> Vec<(SocketAddr, Packet)> {
        let mut sent = Vec::new();
        if let Some(rx) = server.outbound_rx.as_mut() {
            while let Ok(OutboundMessage::SendPacket { packet, addr }) = rx.try_recv() {
                sent.push((addr, packet));
            }
        }
        sent
    }

    fn update(sequence: u32, x: f32) -> Packet {
        Packet::PresenceUpdate {
            sequence,
            timestamp: 0,
            state: PresenceState::at(Vec3::new(x, 0.0, 0.0)),
        }
    }

    #[test]
    fn test_pool_size_precedence() {
        let mut settings = MixerSettings {
            auto_threads: false,
            num_threads: 3,
            ..Default::default()
        };
        assert_eq!(pool_size(&settings, Some(7)), 7);
        assert_eq!(pool_size(&settings, None), 3);

        settings.auto_threads = true;
        assert_eq!(pool_size(&settings, None), detected_concurrency());
    }

    #[test]
    fn test_server_creation() {
        let server = test_server();
        assert_eq!(server.pool().num_threads(), 2usize.min(detected_concurrency()));
        assert_eq!(server.pool().priority_reserved_fraction(), 0.4);
        assert!(server.peers().is_empty());
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_connect_and_disconnect() {
        let mut server = test_server();

        server.handle_packet(Packet::Connect { client_version: PROTOCOL_VERSION }, addr(5000));
        assert_eq!(server.peers().len(), 1);

        let sent = drain(&mut server);
        assert!(matches!(sent[0], (a, Packet::Connected { peer_id: 1 }) if a == addr(5000)));

        server.handle_packet(Packet::Disconnect, addr(5000));
        assert!(server.peers().is_empty());
    }

    #[test]
    fn test_reconnect_replaces_peer() {
        let mut server = test_server();

        server.handle_packet(Packet::Connect { client_version: PROTOCOL_VERSION }, addr(5000));
        server.handle_packet(Packet::Connect { client_version: PROTOCOL_VERSION }, addr(5000));

        assert_eq!(server.peers().len(), 1);
        assert_eq!(server.peers().find_peer_by_addr(addr(5000)), Some(2));
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let mut server = test_server();

        server.handle_packet(Packet::Connect { client_version: 999 }, addr(5000));

        assert!(server.peers().is_empty());
        let sent = drain(&mut server);
        assert!(matches!(&sent[0].1, Packet::Disconnected { reason } if reason.contains("version")));
    }

    #[test]
    fn test_full_relay_rejects_connection() {
        let mut server = test_server();
        for port in 5000..5004 {
            server.handle_packet(Packet::Connect { client_version: PROTOCOL_VERSION }, addr(port));
        }

        assert_eq!(server.peers().len(), 3);
        let sent = drain(&mut server);
        assert!(matches!(&sent[3].1, Packet::Disconnected { reason } if reason == "Relay full"));
    }

    #[test]
    fn test_update_from_unknown_address_is_ignored() {
        let mut server = test_server();
        server.handle_packet(update(1, 0.0), addr(6000));
        assert!(server.peers().is_empty());
    }

    #[test]
    fn test_mix_frame_relays_presence() {
        let mut server = test_server();
        server.handle_packet(Packet::Connect { client_version: PROTOCOL_VERSION }, addr(5000));
        server.handle_packet(Packet::Connect { client_version: PROTOCOL_VERSION }, addr(5001));
        drain(&mut server);

        server.handle_packet(update(1, 1.0), addr(5000));
        server.handle_packet(update(1, 2.0), addr(5001));
        server.mix_frame();

        let sent = drain(&mut server);
        let to_first: Vec<&PresenceEntry> = sent
            .iter()
            .filter(|(a, _)| *a == addr(5000))
            .flat_map(|(_, packet)| match packet {
                Packet::BulkPresence { entries, .. } => entries.iter().collect(),
                _ => Vec::new(),
            })
            .collect();

        assert_eq!(to_first.len(), 1);
        assert_eq!(to_first[0].peer_id, 2);
        assert_eq!(server.frame(), 1);

        let stats = server.harvest_stats();
        assert_eq!(stats.peers_processed, 2);
        assert_eq!(stats.listeners_broadcast_to, 2);
        assert_eq!(stats.sources_included, 2);

        // Harvesting resets the counters
        assert_eq!(server.harvest_stats(), WorkerStats::default());
    }

    fn departures(sent: &[(SocketAddr, Packet)]) -> Vec<(u16, u32)> {
        let mut notices: Vec<(u16, u32)> = sent
            .iter()
            .filter_map(|(a, packet)| match packet {
                Packet::PeerLeft { peer_id } => Some((a.port(), *peer_id)),
                _ => None,
            })
            .collect();
        notices.sort();
        notices
    }

    #[test]
    fn test_departures_are_announced() {
        let mut server = test_server();
        for port in 5000..5003 {
            server.handle_packet(Packet::Connect { client_version: PROTOCOL_VERSION }, addr(port));
        }
        drain(&mut server);

        // Disconnect
        server.handle_packet(Packet::Disconnect, addr(5000));
        assert_eq!(departures(&drain(&mut server)), vec![(5001, 1), (5002, 1)]);

        // Reconnect from the same address replaces peer 2
        server.handle_packet(Packet::Connect { client_version: PROTOCOL_VERSION }, addr(5001));
        assert_eq!(departures(&drain(&mut server)), vec![(5002, 2)]);

        // Timeout
        server.peers.backdate(3, Duration::from_secs(60));
        server.mix_frame();
        assert_eq!(departures(&drain(&mut server)), vec![(5001, 3)]);
        assert_eq!(server.peers().len(), 1);
    }

    #[test]
    fn test_ignore_request_stops_presence_both_ways() {
        let mut server = test_server();
        server.handle_packet(Packet::Connect { client_version: PROTOCOL_VERSION }, addr(5000));
        server.handle_packet(Packet::Connect { client_version: PROTOCOL_VERSION }, addr(5001));
        drain(&mut server);

        server.handle_packet(Packet::IgnoreRequest { peer_id: 2, ignore: true }, addr(5000));
        assert_eq!(departures(&drain(&mut server)), vec![(5001, 1)]);

        server.handle_packet(update(1, 1.0), addr(5000));
        server.handle_packet(update(1, 2.0), addr(5001));
        server.mix_frame();
        let sent = drain(&mut server);
        assert!(sent.iter().all(|(_, p)| !matches!(p, Packet::BulkPresence { .. })));
        assert_eq!(server.harvest_stats().ignored_sources, 2);

        server.handle_packet(Packet::IgnoreRequest { peer_id: 2, ignore: false }, addr(5000));
        server.mix_frame();
        let relayed = drain(&mut server)
            .into_iter()
            .filter(|(_, p)| matches!(p, Packet::BulkPresence { .. }))
            .count();
        assert_eq!(relayed, 2);
    }

    #[test]
    fn test_ignore_request_for_unknown_peer_is_dropped() {
        let mut server = test_server();
        server.handle_packet(Packet::Connect { client_version: PROTOCOL_VERSION }, addr(5000));
        drain(&mut server);

        server.handle_packet(Packet::IgnoreRequest { peer_id: 42, ignore: true }, addr(5000));
        server.handle_packet(Packet::IgnoreRequest { peer_id: 1, ignore: true }, addr(6000));
        assert!(drain(&mut server).is_empty());
    }

    #[test]
    fn test_mix_frame_without_peers() {
        let mut server = test_server();
        server.mix_frame();
        server.mix_frame();

        assert_eq!(server.frame(), 2);
        assert!(drain(&mut server).is_empty());
        assert!(server.pool().counters().is_at_rest());
    }

    #[test]
    fn test_channel_communication() {
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
        let packet = Packet::Connect { client_version: 1 };

        assert!(tx
            .send(ServerMessage::PacketReceived { packet, addr: addr(8080) })
            .is_ok());

        match rx.try_recv().unwrap() {
            ServerMessage::PacketReceived { packet: Packet::Connect { client_version }, addr: a } => {
                assert_eq!(a, addr(8080));
                assert_eq!(client_version, 1);
            }
            _ => panic!("Unexpected message type"),
        }
    }

    #[test]
    fn test_buffer_holds_largest_datagram() {
        assert!(shared::MAX_PAYLOAD_BYTES < 2048);
    }
}
