//! Load generator: simulates many peers publishing presence to a relay.

use bincode::{deserialize, serialize};
use clap::Parser;
use rand::Rng;
use relay::utils::get_timestamp;
use shared::{Packet, PresenceState, Vec3, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{interval, timeout};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
struct Args {
    /// Relay address
    #[clap(short, long, default_value = "127.0.0.1:8080")]
    server: String,
    /// Number of simulated peers
    #[clap(short = 'n', long, default_value = "10")]
    peers: usize,
    /// How long each peer stays connected, in seconds
    #[clap(short, long, default_value = "10")]
    duration: u64,
    /// Presence updates per second per peer
    #[clap(short, long, default_value = "45")]
    rate: u32,
    /// How many of the peers ask to be priority sources
    #[clap(long, default_value = "0")]
    priority_peers: usize,
    /// Side of the square area peers wander in
    #[clap(long, default_value = "50.0")]
    area: f32,
}

#[derive(Debug, Default)]
struct PeerReport {
    peer_id: u32,
    updates_sent: u64,
    datagrams_received: u64,
    entries_received: u64,
    minimal_entries: u64,
    bytes_received: u64,
}

async fn connect(socket: &UdpSocket, server: SocketAddr) -> Result<u32, BoxError> {
    let mut buf = [0u8; 2048];
    socket
        .send_to(&serialize(&Packet::Connect { client_version: PROTOCOL_VERSION })?, server)
        .await?;

    loop {
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf)).await??;
        match deserialize::<Packet>(&buf[..len])? {
            Packet::Connected { peer_id } => return Ok(peer_id),
            Packet::Disconnected { reason } => return Err(format!("rejected: {}", reason).into()),
            _ => continue,
        }
    }
}

async fn simulate_peer(args: Args, server: SocketAddr, wants_priority: bool) -> Result<PeerReport, BoxError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let peer_id = connect(&socket, server).await?;

    let (mut position, heading) = {
        let mut rng = rand::thread_rng();
        let position = Vec3::new(rng.gen_range(0.0..args.area), 0.0, rng.gen_range(0.0..args.area));
        let heading: f32 = rng.gen_range(0.0..std::f32::consts::TAU);
        (position, heading)
    };
    let speed = 1.5;
    let step = 1.0 / args.rate.max(1) as f32;

    let mut report = PeerReport {
        peer_id,
        ..Default::default()
    };
    let mut ticker = interval(Duration::from_secs_f32(step));
    let mut buf = [0u8; 2048];
    let deadline = Instant::now() + Duration::from_secs(args.duration);
    let mut sequence = 0u32;

    while Instant::now() < deadline {
        tokio::select! {
            _ = ticker.tick() => {
                sequence += 1;
                let angle = heading + sequence as f32 * step * 0.5;
                let velocity = Vec3::new(angle.cos() * speed, 0.0, angle.sin() * speed);
                position.x = (position.x + velocity.x * step).rem_euclid(args.area);
                position.z = (position.z + velocity.z * step).rem_euclid(args.area);

                let mut state = PresenceState::at(position);
                state.velocity = velocity;
                state.yaw = angle;
                state.wants_priority = wants_priority;

                let packet = Packet::PresenceUpdate { sequence, timestamp: get_timestamp(), state };
                socket.send_to(&serialize(&packet)?, server).await?;
                report.updates_sent += 1;
            }
            received = socket.recv_from(&mut buf) => {
                let (len, _) = received?;
                if let Ok(Packet::BulkPresence { entries, .. }) = deserialize::<Packet>(&buf[..len]) {
                    report.datagrams_received += 1;
                    report.bytes_received += len as u64;
                    report.entries_received += entries.len() as u64;
                    report.minimal_entries += entries
                        .iter()
                        .filter(|e| matches!(e.detail, shared::PresenceDetail::Minimal { .. }))
                        .count() as u64;
                }
            }
        }
    }

    socket.send_to(&serialize(&Packet::Disconnect)?, server).await?;
    Ok(report)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let server: SocketAddr = args.server.parse()?;

    log::info!(
        "Simulating {} peers ({} priority) against {} for {}s",
        args.peers,
        args.priority_peers,
        server,
        args.duration
    );

    let handles: Vec<_> = (0..args.peers)
        .map(|i| tokio::spawn(simulate_peer(args.clone(), server, i < args.priority_peers)))
        .collect();

    let mut reports = Vec::new();
    for handle in handles {
        match handle.await? {
            Ok(report) => reports.push(report),
            Err(e) => log::warn!("Simulated peer failed: {}", e),
        }
    }

    for report in &reports {
        log::info!(
            "Peer {}: sent {}, received {} entries ({} minimal) in {} datagrams, {:.1} kB",
            report.peer_id,
            report.updates_sent,
            report.entries_received,
            report.minimal_entries,
            report.datagrams_received,
            report.bytes_received as f64 / 1000.0
        );
    }

    let total_bytes: u64 = reports.iter().map(|r| r.bytes_received).sum();
    let seconds = args.duration.max(1) as f64;
    log::info!(
        "{} of {} peers completed; average downstream {:.1} kbps per peer",
        reports.len(),
        args.peers,
        total_bytes as f64 * 8.0 / 1000.0 / seconds / reports.len().max(1) as f64
    );

    Ok(())
}
