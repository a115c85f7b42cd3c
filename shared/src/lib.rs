use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;
pub const BROADCAST_FRAMES_PER_SECOND: u32 = 45;
pub const BYTES_PER_KILOBIT: f32 = 1000.0 / 8.0;
pub const MAX_PAYLOAD_BYTES: usize = 1200;
pub const DEFAULT_PRESENCE_RADIUS: f32 = 0.5;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn distance(&self, other: &Vec3) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        let dz = other.z - self.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// The state a client publishes about itself every frame.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PresenceState {
    pub position: Vec3,
    pub velocity: Vec3,
    pub yaw: f32,
    pub radius: f32,
    /// Client asks to be treated as a priority source.
    pub wants_priority: bool,
}

impl PresenceState {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            velocity: Vec3::ZERO,
            yaw: 0.0,
            radius: DEFAULT_PRESENCE_RADIUS,
            wants_priority: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.position.is_finite()
            && self.velocity.is_finite()
            && self.yaw.is_finite()
            && self.radius.is_finite()
            && self.radius >= 0.0
    }
}

/// How much of a source's state a broadcast entry carries.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum PresenceDetail {
    Full(PresenceState),
    Minimal { position: Vec3 },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PresenceEntry {
    pub peer_id: u32,
    pub sequence: u32,
    pub detail: PresenceDetail,
}

impl PresenceEntry {
    pub fn full(peer_id: u32, sequence: u32, state: PresenceState) -> Self {
        Self {
            peer_id,
            sequence,
            detail: PresenceDetail::Full(state),
        }
    }

    pub fn minimal(peer_id: u32, sequence: u32, position: Vec3) -> Self {
        Self {
            peer_id,
            sequence,
            detail: PresenceDetail::Minimal { position },
        }
    }

    /// Bytes this entry occupies inside a `BulkPresence` datagram.
    pub fn encoded_len(&self) -> usize {
        bincode::serialized_size(self).unwrap_or(0) as usize
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Connect {
        client_version: u32,
    },
    PresenceUpdate {
        sequence: u32,
        timestamp: u64,
        state: PresenceState,
    },
    Disconnect,
    /// Stop (or resume) receiving presence from another peer. Ignoring is mutual.
    IgnoreRequest {
        peer_id: u32,
        ignore: bool,
    },

    Connected {
        peer_id: u32,
    },
    BulkPresence {
        timestamp: u64,
        entries: Vec<PresenceEntry>,
    },
    Disconnected {
        reason: String,
    },
    /// Another peer left or is no longer visible to the receiver.
    PeerLeft {
        peer_id: u32,
    },
}

impl Packet {
    /// Encoded size of a `BulkPresence` datagram before any entries are added.
    pub fn bulk_overhead() -> usize {
        let empty = Packet::BulkPresence {
            timestamp: 0,
            entries: Vec::new(),
        };
        bincode::serialized_size(&empty).unwrap_or(0) as usize
    }
}
