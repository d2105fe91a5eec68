//! One-shot rebalancing from measured speeds.

use super::{SpeedModel, StrategyStep};
use crate::scheduler::Granularity;

/// Recomputes the split from the latest raw per-device times on every
/// iteration. Never reports convergence.
#[derive(Debug, Clone)]
pub struct FullSearch {
    speeds: SpeedModel,
}

impl FullSearch {
    /// Search over `num_devices` devices.
    pub fn new(num_devices: usize) -> Self {
        Self {
            speeds: SpeedModel::new(num_devices),
        }
    }

    /// Next granularity after a dispatch at `last` took `times`.
    pub fn next_granularity(&mut self, last: &Granularity, times: &[f64]) -> StrategyStep {
        self.speeds.observe(last, times);
        match self.speeds.balanced() {
            Some(next) => StrategyStep::proceed(next, false),
            None => StrategyStep::degenerate(last, "no device reported a usable time"),
        }
    }
}
