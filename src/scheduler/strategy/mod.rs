//! Granularity search strategies.
//!
//! Every strategy consumes the granularity dispatched last and the measured
//! per-device times, and proposes the next granularity.

pub mod broyden;
pub mod fixed_point;
pub mod full_search;

pub use broyden::{Broyden, BroydenRule};
pub use fixed_point::FixedPoint;
pub use full_search::FullSearch;

use super::adaptive::SchedulerSettings;
use super::Granularity;
use crate::config::StrategyKind;
use crate::error::Fault;

/// Outcome of one strategy step.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyStep {
    pub granularity: Granularity,
    pub converged: bool,
    /// A recovered fault; `granularity` is then the last known-good one.
    pub fault: Option<Fault>,
}

impl StrategyStep {
    fn proceed(granularity: Granularity, converged: bool) -> Self {
        Self {
            granularity,
            converged,
            fault: None,
        }
    }

    fn degenerate(last: &Granularity, reason: impl Into<String>) -> Self {
        Self {
            granularity: last.clone(),
            converged: false,
            fault: Some(Fault::NumericDegenerate(reason.into())),
        }
    }
}

/// Per-kernel granularity search.
#[derive(Debug, Clone)]
pub enum Strategy {
    FullSearch(FullSearch),
    Broyden(Broyden),
    BadBroyden(Broyden),
    FixedPoint(FixedPoint),
}

impl Strategy {
    /// Strategy for a single kernel. `None` for the cycle LP, which is not a
    /// per-kernel strategy.
    pub fn new(kind: StrategyKind, settings: &SchedulerSettings) -> Option<Self> {
        let n = settings.num_devices;
        Some(match kind {
            StrategyKind::FullSearch => Strategy::FullSearch(FullSearch::new(n)),
            StrategyKind::Broyden => Strategy::Broyden(Broyden::new(
                n,
                BroydenRule::Good,
                settings.tolerance,
                settings.stall_limit,
            )),
            StrategyKind::BadBroyden => Strategy::BadBroyden(Broyden::new(
                n,
                BroydenRule::Bad,
                settings.tolerance,
                settings.stall_limit,
            )),
            StrategyKind::FixedPoint => Strategy::FixedPoint(FixedPoint::new(
                n,
                settings.relaxation,
                settings.tolerance,
            )),
            StrategyKind::MkgrLp => return None,
        })
    }

    /// Configuration name of this strategy.
    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::FullSearch(_) => StrategyKind::FullSearch,
            Strategy::Broyden(_) => StrategyKind::Broyden,
            Strategy::BadBroyden(_) => StrategyKind::BadBroyden,
            Strategy::FixedPoint(_) => StrategyKind::FixedPoint,
        }
    }

    /// `times[d]` is device `d`'s objective time for the dispatch that ran
    /// with `last`.
    pub fn next_granularity(&mut self, last: &Granularity, times: &[f64]) -> StrategyStep {
        match self {
            Strategy::FullSearch(s) => s.next_granularity(last, times),
            Strategy::Broyden(s) | Strategy::BadBroyden(s) => s.next_granularity(last, times),
            Strategy::FixedPoint(s) => s.next_granularity(last, times),
        }
    }
}

/// Last known throughput (share per second) of every device.
#[derive(Debug, Clone)]
pub struct SpeedModel {
    speeds: Vec<Option<f64>>,
}

impl SpeedModel {
    /// Model with no measured device.
    pub fn new(num_devices: usize) -> Self {
        Self {
            speeds: vec![None; num_devices],
        }
    }

    /// Devices that had no work or no usable time keep their old estimate.
    pub fn observe(&mut self, last: &Granularity, times: &[f64]) {
        for ((slot, g), t) in self.speeds.iter_mut().zip(last.shares()).zip(times) {
            if *g > 0.0 && *t > 0.0 && t.is_finite() {
                *slot = Some(g / t);
            }
        }
    }

    /// Last measured speed of `device`.
    pub fn speed(&self, device: usize) -> Option<f64> {
        self.speeds.get(device).copied().flatten()
    }

    /// Shares proportional to speed: the split under which the measured
    /// times would have been equal. Unmeasured devices are assumed to run at
    /// the mean measured speed.
    pub fn balanced(&self) -> Option<Granularity> {
        let known: Vec<f64> = self.speeds.iter().flatten().copied().collect();
        if known.is_empty() {
            return None;
        }
        let mean = known.iter().sum::<f64>() / known.len() as f64;
        let shares: Vec<f64> = self.speeds.iter().map(|s| s.unwrap_or(mean)).collect();
        Granularity::normalized(&shares)
    }
}

/// Solve `a x = b` by Gaussian elimination with partial pivoting.
pub(crate) fn solve(a: &[Vec<f64>], b: &[f64]) -> Option<Vec<f64>> {
    let n = b.len();
    let mut m: Vec<Vec<f64>> = a
        .iter()
        .zip(b)
        .map(|(row, rhs)| {
            let mut r = row.clone();
            r.push(*rhs);
            r
        })
        .collect();

    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))?;
        if m[pivot][col].abs() < 1e-12 {
            return None;
        }
        m.swap(col, pivot);
        for row in col + 1..n {
            let factor = m[row][col] / m[col][col];
            for k in col..=n {
                m[row][k] -= factor * m[col][k];
            }
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| m[row][k] * x[k]).sum();
        x[row] = (m[row][n] - tail) / m[row][row];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}
