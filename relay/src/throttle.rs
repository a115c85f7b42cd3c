//! Load-driven throttling of the broadcast budget
//!
//! A proportional controller over the trailing ratio of time spent mixing
//! to the frame interval. When the relay struggles, the fraction of bandwidth
//! withheld grows; when it recovers, the fraction backs off more slowly. The
//! ratio handed to the pool is the complement: `1.0` means no throttling.

use log::debug;
use std::time::Duration;

/// Mix ratio above which throttling increases.
const TARGET: f32 = 0.9;
/// Mix ratio below which throttling backs off.
const BACKOFF_TARGET: f32 = 0.44;
/// The relay struggles at about this many peers; throttle 2 of them per step.
const STRUGGLES_AT: f32 = 150.0;
const THROTTLE_RATE: f32 = 2.0 / STRUGGLES_AT;
const BACKOFF_RATE: f32 = THROTTLE_RATE / 4.0;
/// Bound on full recovery time, in controller steps
const RECOVERY_TIME: f32 = 180.0;

#[derive(Debug, Clone)]
pub struct ThrottleController {
    trailing_mix_ratio: f32,
    throttled_fraction: f32,
    trailing_frames: u64,
    frame: u64,
}

impl Default for ThrottleController {
    fn default() -> Self {
        Self::new()
    }
}

impl ThrottleController {
    pub fn new() -> Self {
        let trailing_frames = (100.0 * RECOVERY_TIME * BACKOFF_RATE).round() as u64;
        Self {
            trailing_mix_ratio: 0.0,
            throttled_fraction: 0.0,
            trailing_frames: trailing_frames.max(1),
            frame: 0,
        }
    }

    /// Folds one frame's mix time into the controller.
    pub fn update(&mut self, mix_time: Duration, frame_interval: Duration) {
        self.frame += 1;
        if frame_interval.is_zero() {
            return;
        }

        let mix_ratio = mix_time.as_secs_f32() / frame_interval.as_secs_f32();
        let current = 1.0 / self.trailing_frames as f32;
        self.trailing_mix_ratio = (1.0 - current) * self.trailing_mix_ratio + current * mix_ratio;

        if self.frame % self.trailing_frames != 0 {
            return;
        }

        if self.trailing_mix_ratio > TARGET {
            let proportional = 1.0 + ((self.trailing_mix_ratio - TARGET) / 0.1).floor();
            self.throttled_fraction = (self.throttled_fraction + THROTTLE_RATE * proportional).min(1.0);
            debug!(
                "Relay is struggling ({:.3} mix/frame); throttling {:.3} of bandwidth",
                self.trailing_mix_ratio, self.throttled_fraction
            );
        } else if self.throttled_fraction > 0.0 && self.trailing_mix_ratio <= BACKOFF_TARGET {
            let proportional = 1.0 + ((TARGET - self.trailing_mix_ratio) / 0.2).floor();
            self.throttled_fraction = (self.throttled_fraction - BACKOFF_RATE * proportional).max(0.0);
            debug!(
                "Relay is recovering ({:.3} mix/frame); throttling {:.3} of bandwidth",
                self.trailing_mix_ratio, self.throttled_fraction
            );
        }
    }

    /// Scale applied to every peer's bandwidth ceiling, in `[0, 1]`.
    pub fn throttling_ratio(&self) -> f32 {
        1.0 - self.throttled_fraction
    }

    pub fn trailing_mix_ratio(&self) -> f32 {
        self.trailing_mix_ratio
    }

    pub fn trailing_frames(&self) -> u64 {
        self.trailing_frames
    }
}
