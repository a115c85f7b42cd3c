//! Per-listener bandwidth allocation between priority and ordinary sources
//!
//! Every listener has a per-frame ceiling derived from the configured
//! per-peer bandwidth and the current throttling ratio. A fixed fraction of
//! that ceiling is reserved for priority sources; they are served first, in
//! relevance order, out of the reserve. Whatever is left of the ceiling,
//! including any reserve the priority sources did not need, is handed out
//! greedily in relevance order to the ordinary sources and to priority
//! sources whose demand exceeded the reserve.
//!
//! Allocation is continuous: a source may be granted less than it asked for,
//! and the caller decides how to degrade its payload to fit.

use shared::BYTES_PER_KILOBIT;
use std::cmp::Ordering;

/// Fraction of the ceiling reserved for priority sources unless configured otherwise.
pub const DEFAULT_PRIORITY_RESERVED_FRACTION: f32 = 0.4;

/// Bandwidth knobs for one broadcast phase.
///
/// Snapshotted once per dispatch and read-only while workers run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetParams {
    /// Share of the ceiling reserved for priority sources, in `[0, 1]`
    pub priority_reserved_fraction: f32,
    /// Configured per-listener bandwidth before throttling
    pub max_kbps_per_peer: f32,
    /// Global scale applied to every ceiling under load, in `[0, 1]`
    pub throttling_ratio: f32,
}

impl BudgetParams {
    /// Builds a parameter set, clamping every value into its valid range.
    pub fn new(priority_reserved_fraction: f32, max_kbps_per_peer: f32, throttling_ratio: f32) -> Self {
        Self {
            priority_reserved_fraction: clamp_unit(priority_reserved_fraction),
            max_kbps_per_peer: max_kbps_per_peer.max(0.0),
            throttling_ratio: clamp_unit(throttling_ratio),
        }
    }

    /// Per-listener ceiling in kbps after throttling.
    pub fn ceiling_kbps(&self) -> f32 {
        self.max_kbps_per_peer * self.throttling_ratio
    }

    /// Per-listener ceiling in bytes for a single broadcast frame.
    pub fn ceiling_bytes_per_frame(&self, frames_per_second: u32) -> f32 {
        if frames_per_second == 0 {
            return 0.0;
        }
        self.ceiling_kbps() * BYTES_PER_KILOBIT / frames_per_second as f32
    }

    /// Portion of the ceiling held back for priority sources.
    pub fn priority_reserve_kbps(&self) -> f32 {
        self.ceiling_kbps() * self.priority_reserved_fraction
    }
}

impl Default for BudgetParams {
    fn default() -> Self {
        Self::new(DEFAULT_PRIORITY_RESERVED_FRACTION, 0.0, 1.0)
    }
}

/// Clamps into `[0, 1]`, mapping NaN to 0.
pub fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

/// One source asking for a share of a listener's ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct Demand {
    pub id: u32,
    pub amount: f32,
    pub priority: bool,
    /// Higher is served earlier
    pub relevance: f32,
}

/// What one source was granted.
#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    pub id: u32,
    pub amount: f32,
    pub demand: f32,
    pub priority: bool,
}

impl Grant {
    pub fn is_complete(&self) -> bool {
        self.amount >= self.demand
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Allocation {
    /// Non-zero grants; priority sources first, each group in relevance order
    pub grants: Vec<Grant>,
    pub priority_total: f32,
    pub ordinary_total: f32,
    /// Sources that received less than they asked for
    pub shortfalls: usize,
}

impl Allocation {
    pub fn total(&self) -> f32 {
        self.priority_total + self.ordinary_total
    }

    pub fn granted(&self, id: u32) -> f32 {
        self.grants
            .iter()
            .find(|grant| grant.id == id)
            .map(|grant| grant.amount)
            .unwrap_or(0.0)
    }
}

/// Splits `ceiling` between `demands`.
///
/// Guarantees, for `f = priority_reserved_fraction` and total priority
/// demand `Dp`:
/// - priority sources receive at least `min(Dp, f * ceiling)`
/// - the sum of all grants never exceeds `ceiling`
/// - no source is granted more than it asked for
pub fn allocate(demands: &[Demand], ceiling: f32, priority_reserved_fraction: f32) -> Allocation {
    let ceiling = ceiling.max(0.0);
    let reserve = ceiling * clamp_unit(priority_reserved_fraction);

    let wanted: Vec<f32> = demands.iter().map(|d| d.amount.max(0.0)).collect();
    let mut granted = vec![0.0f32; demands.len()];

    let mut order: Vec<usize> = (0..demands.len()).collect();
    order.sort_by(|&a, &b| by_relevance(&demands[a], &demands[b]));

    // Priority sources out of the reserve
    let mut reserve_left = reserve;
    for &i in order.iter().filter(|&&i| demands[i].priority) {
        if reserve_left <= 0.0 {
            break;
        }
        let take = wanted[i].min(reserve_left);
        granted[i] += take;
        reserve_left -= take;
    }

    // Everyone else, plus unmet priority demand, out of what remains
    let mut remaining = (ceiling - (reserve - reserve_left)).max(0.0);
    for &i in &order {
        if remaining <= 0.0 {
            break;
        }
        let take = (wanted[i] - granted[i]).max(0.0).min(remaining);
        granted[i] += take;
        remaining -= take;
    }

    let mut allocation = Allocation::default();
    let priority_first = order
        .iter()
        .filter(|&&i| demands[i].priority)
        .chain(order.iter().filter(|&&i| !demands[i].priority));

    for &i in priority_first {
        let demand = &demands[i];
        if granted[i] < wanted[i] {
            allocation.shortfalls += 1;
        }
        if granted[i] <= 0.0 {
            continue;
        }
        if demand.priority {
            allocation.priority_total += granted[i];
        } else {
            allocation.ordinary_total += granted[i];
        }
        allocation.grants.push(Grant {
            id: demand.id,
            amount: granted[i],
            demand: wanted[i],
            priority: demand.priority,
        });
    }

    allocation
}

fn by_relevance(a: &Demand, b: &Demand) -> Ordering {
    b.relevance
        .total_cmp(&a.relevance)
        .then_with(|| a.id.cmp(&b.id))
}
