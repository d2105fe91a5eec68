//! Damped fixed-point iteration.

use super::{SpeedModel, StrategyStep};
use crate::scheduler::Granularity;

/// Relaxed fixed-point iteration `g' = (1 - w) g + w * alpha / f(g)`, where
/// `f_i(g)` is device i's time per unit share and `alpha` normalizes the
/// proposal to sum 1. Slower than Broyden but never diverges.
#[derive(Debug, Clone)]
pub struct FixedPoint {
    speeds: SpeedModel,
    relaxation: f64,
    tolerance: f64,
    /// Split dispatched on the previous call.
    previous: Option<Granularity>,
}

impl FixedPoint {
    /// Iteration damped by `relaxation`, in (0, 1].
    pub fn new(num_devices: usize, relaxation: f64, tolerance: f64) -> Self {
        Self {
            speeds: SpeedModel::new(num_devices),
            relaxation,
            tolerance,
            previous: None,
        }
    }

    /// Next granularity after a dispatch at `last` took `times`.
    pub fn next_granularity(&mut self, last: &Granularity, times: &[f64]) -> StrategyStep {
        self.speeds.observe(last, times);
        // Same split twice in a row: quantization absorbs the relaxed step.
        let repeated = self
            .previous
            .replace(last.clone())
            .map_or(false, |p| p.distance(last) < f64::EPSILON);
        let target = match self.speeds.balanced() {
            Some(t) => t,
            None => return StrategyStep::degenerate(last, "no device reported a usable time"),
        };

        let w = self.relaxation;
        let shares: Vec<f64> = last
            .shares()
            .iter()
            .zip(target.shares())
            .map(|(g, t)| (1.0 - w) * g + w * t)
            .collect();

        match Granularity::from_shares(&shares) {
            Some(next) => {
                let converged = repeated || next.distance(last) < self.tolerance;
                StrategyStep::proceed(next, converged)
            }
            None => StrategyStep::degenerate(last, "relaxed step left the simplex"),
        }
    }
}
