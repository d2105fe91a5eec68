//! Quasi-Newton search for the balanced split.
//!
//! The unknowns are the first `n - 1` shares; the last share is implied by
//! the simplex constraint. The residual is `F(g) = target(g) - g`, where
//! `target` is the speed-proportional split implied by the latest times, so
//! `F = 0` exactly when all devices finish together.

use super::{solve, SpeedModel, StrategyStep};
use crate::error::Fault;
use crate::scheduler::Granularity;
use tracing::debug;

/// Which matrix the secant update maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroydenRule {
    /// Updates the Jacobian and solves `J s = -F` each step.
    Good,
    /// Updates the inverse Jacobian directly; `s = -H F`.
    Bad,
}

/// Granularities closer than this count as identical for stall detection.
const STALL_EPSILON: f64 = 1e-9;
/// Secant denominators below this skip the update.
const MIN_DENOM: f64 = 1e-18;

/// Broyden search over the first `n - 1` shares.
#[derive(Debug, Clone)]
pub struct Broyden {
    rule: BroydenRule,
    speeds: SpeedModel,
    matrix: Vec<Vec<f64>>,
    prev: Option<(Vec<f64>, Vec<f64>)>,
    stalls: u32,
    stall_limit: u32,
    tolerance: f64,
}

impl Broyden {
    /// Search starting from a negated identity matrix.
    pub fn new(num_devices: usize, rule: BroydenRule, tolerance: f64, stall_limit: u32) -> Self {
        let m = num_devices.saturating_sub(1);
        Self {
            rule,
            speeds: SpeedModel::new(num_devices),
            matrix: neg_identity(m),
            prev: None,
            stalls: 0,
            stall_limit,
            tolerance,
        }
    }

    /// Update rule in use.
    pub fn rule(&self) -> BroydenRule {
        self.rule
    }

    /// Next granularity after a dispatch at `last` took `times`.
    pub fn next_granularity(&mut self, last: &Granularity, times: &[f64]) -> StrategyStep {
        if last.len() < 2 {
            return StrategyStep::proceed(last.clone(), true);
        }
        self.speeds.observe(last, times);
        let target = match self.speeds.balanced() {
            Some(t) => t,
            None => return StrategyStep::degenerate(last, "no device reported a usable time"),
        };

        let m = last.len() - 1;
        let x = last.shares()[..m].to_vec();
        let f: Vec<f64> = (0..m).map(|i| target.shares()[i] - x[i]).collect();
        let mut fault = None;
        let mut repeated = false;

        if let Some((xp, fp)) = self.prev.take() {
            let dx = sub(&x, &xp);
            let df = sub(&f, &fp);
            // The grid can pin the dispatched split while the proposal moves.
            repeated = norm_inf(&dx) < STALL_EPSILON;
            if !self.update(&dx, &df) {
                self.reset();
                fault = Some(Fault::NumericDegenerate(
                    "secant update produced a non-finite matrix".into(),
                ));
            }
        }
        self.prev = Some((x.clone(), f.clone()));

        if norm_inf(&f) < self.tolerance {
            self.stalls = 0;
            return StrategyStep {
                granularity: last.clone(),
                converged: true,
                fault,
            };
        }

        let neg_f: Vec<f64> = f.iter().map(|v| -v).collect();
        let step = match self.rule {
            BroydenRule::Good => solve(&self.matrix, &neg_f),
            BroydenRule::Bad => Some(mat_vec(&self.matrix, &neg_f)),
        };
        let step = match step.filter(|s| s.iter().all(|v| v.is_finite())) {
            Some(s) => s,
            None => {
                // Fall back to the plain fixed-point step.
                self.reset();
                fault = Some(Fault::NumericDegenerate("singular jacobian".into()));
                f.clone()
            }
        };

        let mut shares: Vec<f64> = x.iter().zip(&step).map(|(a, b)| a + b).collect();
        let head: f64 = shares.iter().sum();
        shares.push(1.0 - head);

        let next = match Granularity::from_shares(&shares) {
            Some(g) => g,
            None => return StrategyStep::degenerate(last, "step left the simplex"),
        };

        if repeated || next.distance(last) < STALL_EPSILON {
            self.stalls += 1;
        } else {
            self.stalls = 0;
        }
        let converged = self.stalls >= self.stall_limit;
        debug!(
            residual = norm_inf(&f),
            next = %next,
            stalls = self.stalls,
            "broyden step"
        );

        StrategyStep {
            granularity: next,
            converged,
            fault,
        }
    }

    /// Rank-one secant update. Returns false if the matrix went non-finite.
    fn update(&mut self, dx: &[f64], df: &[f64]) -> bool {
        let (num_base, proj, denom) = match self.rule {
            // J += ((dF - J dx) dx^T) / (dx^T dx)
            BroydenRule::Good => (df, dx, dot(dx, dx)),
            // H += ((dx - H dF) dF^T) / (dF^T dF)
            BroydenRule::Bad => (dx, df, dot(df, df)),
        };
        if denom < MIN_DENOM {
            return true;
        }
        let predicted = mat_vec(&self.matrix, proj);
        let correction = sub(num_base, &predicted);
        for (row, c) in self.matrix.iter_mut().zip(&correction) {
            for (cell, p) in row.iter_mut().zip(proj) {
                *cell += c * p / denom;
            }
        }
        self.matrix.iter().flatten().all(|v| v.is_finite())
    }

    fn reset(&mut self) {
        self.matrix = neg_identity(self.matrix.len());
        self.prev = None;
    }
}

fn neg_identity(m: usize) -> Vec<Vec<f64>> {
    (0..m)
        .map(|i| (0..m).map(|j| if i == j { -1.0 } else { 0.0 }).collect())
        .collect()
}

fn mat_vec(a: &[Vec<f64>], x: &[f64]) -> Vec<f64> {
    a.iter().map(|row| dot(row, x)).collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn sub(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| x - y).collect()
}

fn norm_inf(v: &[f64]) -> f64 {
    v.iter().fold(0.0, |acc, x| acc.max(x.abs()))
}
