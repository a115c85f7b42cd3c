//! Integration tests for the presence relay
//!
//! These tests validate the worker pool, the bandwidth split and the relay
//! end to end over real UDP sockets.

use bincode::{deserialize, serialize};
use relay::budget::{self, BudgetParams, Demand};
use relay::config::MixerSettings;
use relay::job::{BroadcastFrame, MixJobs};
use relay::network::{Server, ServerMessage};
use relay::pool::WorkerPool;
use relay::worker::Worker;
use shared::{Packet, PresenceState, Vec3, PROTOCOL_VERSION};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Records which worker ran which peer in each phase
#[derive(Default)]
struct Recorder {
    incoming: Mutex<Vec<(usize, u32)>>,
    broadcasts: Mutex<Vec<(usize, u32)>>,
    budgets: Mutex<Vec<BudgetParams>>,
}

impl MixJobs for Recorder {
    type Peer = u32;

    fn process_incoming(&self, worker: &mut Worker, peer: &u32) {
        self.incoming.lock().unwrap().push((worker.id(), *peer));
    }

    fn broadcast(&self, worker: &mut Worker, listener: &u32, frame: &BroadcastFrame<u32>) {
        self.broadcasts.lock().unwrap().push((worker.id(), *listener));
        self.budgets.lock().unwrap().push(frame.budget);
    }
}

fn assert_exactly_once(records: &[(usize, u32)], peers: &[u32], threads: usize) {
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for (worker_id, peer) in records {
        assert!(*worker_id < threads, "unknown worker {}", worker_id);
        *counts.entry(*peer).or_default() += 1;
    }
    assert_eq!(counts.len(), peers.len());
    for peer in peers {
        assert_eq!(counts.get(peer), Some(&1), "peer {} not run exactly once", peer);
    }
}

/// WORKER POOL TESTS
mod pool_tests {
    use super::*;

    /// Four workers, ten peers: each peer runs exactly once per phase
    #[test]
    fn four_workers_ten_peers() {
        let mut pool = WorkerPool::with_threads(Recorder::default(), 4).unwrap();
        let peers: Vec<u32> = (1..=10).collect();

        pool.process_incoming(&peers);
        pool.broadcast(&peers, Instant::now(), 64.0, 1.0);

        assert_exactly_once(&pool.jobs().incoming.lock().unwrap(), &peers, 4);
        assert_exactly_once(&pool.jobs().broadcasts.lock().unwrap(), &peers, 4);
        assert!(pool.counters().is_at_rest());
        assert_eq!(pool.queue_len(), 0);
    }

    /// Many back-to-back frames never lose or duplicate a peer
    #[test]
    fn repeated_frames_stay_exact() {
        let mut pool = WorkerPool::with_threads(Recorder::default(), 8).unwrap();
        let peers: Vec<u32> = (0..257).collect();

        for _ in 0..50 {
            pool.process_incoming(&peers);
        }

        let incoming = pool.jobs().incoming.lock().unwrap();
        assert_eq!(incoming.len(), 50 * peers.len());
        let unique: HashSet<u32> = incoming.iter().map(|(_, peer)| *peer).collect();
        assert_eq!(unique.len(), peers.len());
    }

    /// Growing and shrinking between frames keeps dispatch exact
    #[test]
    fn resize_between_frames() {
        let mut pool = WorkerPool::with_threads(Recorder::default(), 2).unwrap();
        let peers: Vec<u32> = (1..=20).collect();

        for threads in [6, 3, 3, 1, 8] {
            pool.set_num_threads(threads).unwrap();
            assert_eq!(pool.num_threads(), threads.min(pool.max_threads()));

            pool.jobs().incoming.lock().unwrap().clear();
            pool.process_incoming(&peers);

            let incoming = pool.jobs().incoming.lock().unwrap();
            let unique: HashSet<u32> = incoming.iter().map(|(_, peer)| *peer).collect();
            assert_eq!(incoming.len(), peers.len());
            assert_eq!(unique.len(), peers.len());
            assert!(pool.counters().is_at_rest());
        }
    }

    /// Setting the current size again leaves the same threads in place
    #[test]
    fn same_size_is_a_noop() {
        let mut pool = WorkerPool::with_threads(Recorder::default(), 4).unwrap();
        let mut before = Vec::new();
        pool.each(|worker| before.push(worker.id()));

        pool.set_num_threads(4).unwrap();

        let mut after = Vec::new();
        pool.each(|worker| after.push(worker.id()));
        assert_eq!(before, after);
    }

    /// Dropping a pool with workers parked in the barrier returns promptly
    #[test]
    fn drop_joins_workers() {
        let start = Instant::now();
        {
            let mut pool = WorkerPool::with_threads(Recorder::default(), 8).unwrap();
            pool.process_incoming(&[1, 2, 3]);
        }
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}

/// BANDWIDTH SPLIT TESTS
mod budget_tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn split(frame_budget: BudgetParams, priority: f32, ordinary: f32, ordinary_first: bool) -> (f32, f32) {
        let (p_rel, o_rel) = if ordinary_first { (1.0, 2.0) } else { (2.0, 1.0) };
        let demands = [
            Demand { id: 1, amount: priority, priority: true, relevance: p_rel },
            Demand { id: 2, amount: ordinary, priority: false, relevance: o_rel },
        ];
        let allocation = budget::allocate(
            &demands,
            frame_budget.ceiling_kbps(),
            frame_budget.priority_reserved_fraction,
        );
        assert!(allocation.total() <= frame_budget.ceiling_kbps() + 0.001);
        (allocation.granted(1), allocation.granted(2))
    }

    /// The budget each broadcast job sees is the one the caller configured
    #[test]
    fn broadcast_frame_carries_budget() {
        let mut pool = WorkerPool::with_threads(Recorder::default(), 2).unwrap();
        pool.set_priority_reserved_fraction(0.4);
        pool.broadcast(&[1, 2, 3], Instant::now(), 64.0, 1.0);

        let budgets = pool.jobs().budgets.lock().unwrap();
        assert_eq!(budgets.len(), 3);
        for budget in budgets.iter() {
            assert_approx_eq!(budget.ceiling_kbps(), 64.0, 0.001);
            assert_approx_eq!(budget.priority_reserve_kbps(), 25.6, 0.001);
        }
    }

    /// Both kinds of source want more than the ceiling
    #[test]
    fn both_saturated() {
        let params = BudgetParams::new(0.4, 64.0, 1.0);
        let (priority, ordinary) = split(params, 80.0, 40.0, true);
        assert!(priority >= 25.6 - 0.001);
        assert_approx_eq!(priority + ordinary, 64.0, 0.001);
    }

    /// Priority demand below the reserve leaves the rest to ordinary sources
    #[test]
    fn priority_starved() {
        let params = BudgetParams::new(0.4, 64.0, 1.0);
        let (priority, ordinary) = split(params, 10.0, 80.0, false);
        assert_approx_eq!(priority, 10.0, 0.001);
        assert_approx_eq!(ordinary, 54.0, 0.001);
    }

    /// Little ordinary demand lets priority sources spill past the reserve
    #[test]
    fn ordinary_starved() {
        let params = BudgetParams::new(0.4, 64.0, 1.0);
        let (priority, ordinary) = split(params, 80.0, 5.0, true);
        assert_approx_eq!(ordinary, 5.0, 0.001);
        assert_approx_eq!(priority, 59.0, 0.001);
    }

    /// Throttling scales the whole ceiling, reserve included
    #[test]
    fn throttled_ceiling() {
        let params = BudgetParams::new(0.4, 64.0, 0.5);
        let (priority, ordinary) = split(params, 80.0, 40.0, true);
        assert_approx_eq!(priority + ordinary, 32.0, 0.001);
        assert!(priority >= 12.8 - 0.001);
    }
}

/// RELAY TESTS
mod relay_tests {
    use super::*;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    fn settings() -> MixerSettings {
        MixerSettings {
            auto_threads: false,
            num_threads: 2,
            stats_interval_frames: 0,
            ..Default::default()
        }
    }

    async fn send(socket: &UdpSocket, packet: &Packet, to: std::net::SocketAddr) {
        socket.send_to(&serialize(packet).unwrap(), to).await.unwrap();
    }

    async fn recv(socket: &UdpSocket) -> Packet {
        let mut buf = [0u8; 2048];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for relay")
            .unwrap();
        deserialize(&buf[..len]).unwrap()
    }

    async fn connect(socket: &UdpSocket, relay: std::net::SocketAddr) -> u32 {
        send(socket, &Packet::Connect { client_version: PROTOCOL_VERSION }, relay).await;
        loop {
            if let Packet::Connected { peer_id } = recv(socket).await {
                return peer_id;
            }
        }
    }

    /// Two peers publish over UDP and each receives the other's presence
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn presence_round_trip_over_udp() {
        let mut server = Server::new("127.0.0.1:0", settings(), None).await.unwrap();
        let relay_addr = server.local_addr().unwrap();
        let control = server.control_handle();
        let relay = tokio::spawn(async move { server.run().await.is_ok() });

        let alice = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bob = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let alice_id = connect(&alice, relay_addr).await;
        let bob_id = connect(&bob, relay_addr).await;
        assert_ne!(alice_id, bob_id);

        let update = |x: f32| Packet::PresenceUpdate {
            sequence: 1,
            timestamp: 0,
            state: PresenceState::at(Vec3::new(x, 0.0, 0.0)),
        };
        send(&alice, &update(1.0), relay_addr).await;
        send(&bob, &update(2.0), relay_addr).await;

        let seen_by_alice = loop {
            if let Packet::BulkPresence { entries, .. } = recv(&alice).await {
                break entries;
            }
        };
        assert_eq!(seen_by_alice.len(), 1);
        assert_eq!(seen_by_alice[0].peer_id, bob_id);
        assert_eq!(seen_by_alice[0].sequence, 1);

        let seen_by_bob = loop {
            if let Packet::BulkPresence { entries, .. } = recv(&bob).await {
                break entries;
            }
        };
        assert_eq!(seen_by_bob[0].peer_id, alice_id);

        control.send(ServerMessage::Shutdown).unwrap();
        assert!(relay.await.unwrap());
    }

    /// Garbage datagrams are dropped without disturbing the relay
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_datagrams_are_ignored() {
        let mut server = Server::new("127.0.0.1:0", settings(), None).await.unwrap();
        let relay_addr = server.local_addr().unwrap();
        let control = server.control_handle();
        let relay = tokio::spawn(async move { server.run().await.is_ok() });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&[0xff, 0x00, 0x13, 0x37], relay_addr).await.unwrap();
        client.send_to(&[], relay_addr).await.unwrap();

        assert_eq!(connect(&client, relay_addr).await, 1);

        control.send(ServerMessage::Shutdown).unwrap();
        assert!(relay.await.unwrap());
    }

    /// A relay can be driven frame by frame without a running loop
    #[test]
    fn frames_driven_by_hand() {
        let mut server =
            tokio_test::block_on(Server::new("127.0.0.1:0", settings(), Some(3))).unwrap();
        assert_eq!(server.pool().num_threads(), 3usize.min(server.pool().max_threads()));

        let addrs: Vec<std::net::SocketAddr> =
            (7000..7005).map(|port| ([127, 0, 0, 1], port).into()).collect();
        for addr in &addrs {
            server.handle_packet(Packet::Connect { client_version: PROTOCOL_VERSION }, *addr);
        }
        for (i, addr) in addrs.iter().enumerate() {
            server.handle_packet(
                Packet::PresenceUpdate {
                    sequence: 1,
                    timestamp: 0,
                    state: PresenceState::at(Vec3::new(i as f32, 0.0, 0.0)),
                },
                *addr,
            );
        }

        server.mix_frame();
        let first = server.harvest_stats();
        assert_eq!(first.peers_processed, 5);
        assert_eq!(first.listeners_broadcast_to, 5);
        assert_eq!(first.sources_included, 20);

        // Nothing new: every source is held back
        server.mix_frame();
        let second = server.harvest_stats();
        assert_eq!(second.sources_included, 0);
        assert_eq!(second.held_back_sources, 20);

        server.pool_mut().set_num_threads(1).unwrap();
        server.handle_packet(Packet::Disconnect, addrs[0]);
        server.mix_frame();
        assert_eq!(server.harvest_stats().listeners_broadcast_to, 4);
    }
}
