//! Relay settings
//!
//! Settings come from an optional JSON file; every field has a default, so
//! an empty object is a valid configuration. Out-of-range values are clamped
//! with a warning rather than rejected.

use crate::budget::DEFAULT_PRIORITY_RESERVED_FRACTION;
use log::warn;
use serde::Deserialize;
use shared::Vec3;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const KILO_PER_MEGA: f32 = 1000.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read settings file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid settings JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Axis-aligned region whose occupants are treated as priority sources.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PriorityZone {
    pub min: Vec3Setting,
    pub max: Vec3Setting,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Vec3Setting(pub f32, pub f32, pub f32);

impl From<Vec3Setting> for Vec3 {
    fn from(v: Vec3Setting) -> Self {
        Vec3::new(v.0, v.1, v.2)
    }
}

impl PriorityZone {
    pub fn contains(&self, point: &Vec3) -> bool {
        let (min, max) = (Vec3::from(self.min), Vec3::from(self.max));
        (min.x..=max.x).contains(&point.x)
            && (min.y..=max.y).contains(&point.y)
            && (min.z..=max.z).contains(&point.z)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MixerSettings {
    /// Downstream bandwidth per peer, in Mbps
    pub max_node_send_bandwidth: f32,
    /// Size the pool from hardware concurrency instead of `num_threads`
    pub auto_threads: bool,
    pub num_threads: usize,
    /// Share of each peer's bandwidth reserved for priority sources
    pub priority_fraction: f32,
    pub broadcast_rate: u32,
    pub max_peers: usize,
    pub peer_timeout_secs: u64,
    /// Honour `wants_priority` in client updates
    pub allow_self_priority: bool,
    pub priority_zones: Vec<PriorityZone>,
    /// Log aggregated worker stats every this many frames; 0 disables
    pub stats_interval_frames: u64,
}

impl Default for MixerSettings {
    fn default() -> Self {
        Self {
            max_node_send_bandwidth: 5.0,
            auto_threads: true,
            num_threads: 1,
            priority_fraction: DEFAULT_PRIORITY_RESERVED_FRACTION,
            broadcast_rate: shared::BROADCAST_FRAMES_PER_SECOND,
            max_peers: 256,
            peer_timeout_secs: 5,
            allow_self_priority: false,
            priority_zones: Vec::new(),
            stats_interval_frames: 450,
        }
    }
}

impl MixerSettings {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let settings: MixerSettings = serde_json::from_str(json)?;
        Ok(settings.validated())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Clamps every field into range, logging each correction.
    pub fn validated(mut self) -> Self {
        if !self.max_node_send_bandwidth.is_finite() || self.max_node_send_bandwidth < 0.0 {
            warn!(
                "max_node_send_bandwidth {} is invalid; using 5.0 Mbps",
                self.max_node_send_bandwidth
            );
            self.max_node_send_bandwidth = 5.0;
        }

        let fraction = crate::budget::clamp_unit(self.priority_fraction);
        if fraction != self.priority_fraction {
            warn!(
                "priority_fraction {} out of range; using {}",
                self.priority_fraction, fraction
            );
            self.priority_fraction = fraction;
        }

        if self.num_threads == 0 {
            warn!("num_threads must be at least 1; using 1");
            self.num_threads = 1;
        }

        if self.broadcast_rate == 0 {
            warn!(
                "broadcast_rate must be positive; using {}",
                shared::BROADCAST_FRAMES_PER_SECOND
            );
            self.broadcast_rate = shared::BROADCAST_FRAMES_PER_SECOND;
        }

        if self.max_peers == 0 {
            warn!("max_peers must be positive; using 1");
            self.max_peers = 1;
        }

        self
    }

    pub fn max_kbps_per_peer(&self) -> f32 {
        self.max_node_send_bandwidth * KILO_PER_MEGA
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.broadcast_rate.max(1) as f64)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    pub fn in_priority_zone(&self, position: &Vec3) -> bool {
        self.priority_zones.iter().any(|zone| zone.contains(position))
    }
}
