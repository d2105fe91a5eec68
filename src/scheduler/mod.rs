//! Adaptive work partitioning.
//!
//! Each kernel owns a [`SchedulingState`] that the control loop in
//! [`adaptive`] mutates once per dispatch: it legalizes a candidate
//! granularity against the oracle, hands the split to the driver, and feeds
//! the measured per-device times to the active [`Strategy`]. Cycles of
//! interdependent kernels are scheduled jointly by [`cycle`].

pub mod adaptive;
pub mod best;
pub mod cycle;
pub mod strategy;

pub use adaptive::{KernelScheduler, PartitionDecision, ReportOutcome, SchedulerSettings};
pub use best::BestTracker;
pub use cycle::{Binding, CycleOutcome, CycleScheduler, CycleSolution, MultiKernelSolver, Pass};
pub use strategy::{Strategy, StrategyStep};

use crate::device::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// Caller-visible kernel handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KernelId(pub u64);

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kernel {}", self.0)
    }
}

/// Fraction of the iteration space given to each device. Shares are in
/// [0, 1] and sum to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Granularity(Vec<f64>);

impl Granularity {
    /// Equal shares for every device.
    pub fn uniform(num_devices: usize) -> Self {
        Self(vec![1.0 / num_devices as f64; num_devices])
    }

    /// All work on one device.
    pub fn single(num_devices: usize, device: DeviceId) -> Self {
        let mut shares = vec![0.0; num_devices];
        shares[device.0] = 1.0;
        Self(shares)
    }

    /// Project arbitrary shares onto the simplex: clamp each to [0, 1] and
    /// rescale to sum 1. `None` when a share is not finite or all are zero.
    pub fn from_shares(shares: &[f64]) -> Option<Self> {
        if shares.is_empty() || shares.iter().any(|s| !s.is_finite()) {
            return None;
        }
        let clamped: Vec<f64> = shares.iter().map(|s| s.clamp(0.0, 1.0)).collect();
        let sum: f64 = clamped.iter().sum();
        if sum <= f64::EPSILON {
            return None;
        }
        Some(Self(clamped.into_iter().map(|s| s / sum).collect()))
    }

    /// Shares proportional to non-negative `weights` of any magnitude.
    /// `None` when a weight is negative or not finite, or all are zero.
    pub fn normalized(weights: &[f64]) -> Option<Self> {
        if weights.is_empty() || weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return None;
        }
        let sum: f64 = weights.iter().sum();
        if sum <= f64::EPSILON {
            return None;
        }
        Some(Self(weights.iter().map(|w| w / sum).collect()))
    }

    /// Share of each device, in device order.
    pub fn shares(&self) -> &[f64] {
        &self.0
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for a granularity over no devices.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Share of `device`; zero when out of range.
    pub fn share(&self, device: DeviceId) -> f64 {
        self.0.get(device.0).copied().unwrap_or(0.0)
    }

    /// Largest per-device difference.
    pub fn distance(&self, other: &Granularity) -> f64 {
        self.0
            .iter()
            .zip(&other.0)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }

    /// Device holding the largest share; ties go to the lower index.
    pub fn dominant(&self) -> DeviceId {
        let mut best = 0;
        for (i, s) in self.0.iter().enumerate() {
            if *s > self.0[best] {
                best = i;
            }
        }
        DeviceId(best)
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, s) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:.4}", s)?;
        }
        f.write_str("]")
    }
}

/// Per-device times measured for one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationTimers {
    pub kernel: Vec<Duration>,
    pub h2d: Vec<Duration>,
    pub d2h: Vec<Duration>,
}

impl IterationTimers {
    /// Timers from explicit durations.
    pub fn new(kernel: Vec<Duration>, h2d: Vec<Duration>, d2h: Vec<Duration>) -> Self {
        Self { kernel, h2d, d2h }
    }

    /// Kernel times only; transfer times are zero.
    pub fn kernel_only(kernel: Vec<Duration>) -> Self {
        let n = kernel.len();
        Self {
            kernel,
            h2d: vec![Duration::ZERO; n],
            d2h: vec![Duration::ZERO; n],
        }
    }

    /// Kernel times in seconds from plain floats, handy for synthetic drivers.
    pub fn from_secs(kernel: &[f64], h2d: &[f64], d2h: &[f64]) -> Self {
        let conv = |v: &[f64]| v.iter().map(|s| Duration::from_secs_f64(s.max(0.0))).collect();
        Self {
            kernel: conv(kernel),
            h2d: conv(h2d),
            d2h: conv(d2h),
        }
    }

    /// Number of devices measured.
    pub fn num_devices(&self) -> usize {
        self.kernel.len()
    }

    /// True when every vector has one entry per device.
    pub fn is_consistent(&self) -> bool {
        self.h2d.len() == self.kernel.len() && self.d2h.len() == self.kernel.len()
    }

    /// Per-device objective in seconds. Transfer time counts only when the
    /// objective is communication-aware.
    pub fn device_times(&self, comm_aware: bool) -> Vec<f64> {
        (0..self.kernel.len())
            .map(|d| {
                let mut t = self.kernel[d].as_secs_f64();
                if comm_aware {
                    t += self.h2d[d].as_secs_f64() + self.d2h[d].as_secs_f64();
                }
                t
            })
            .collect()
    }

    /// Completion time of the last device.
    pub fn makespan(&self, comm_aware: bool) -> f64 {
        self.device_times(comm_aware).into_iter().fold(0.0, f64::max)
    }
}

/// Rolling window of the most recent per-device timers.
#[derive(Debug, Clone)]
pub struct DeviceTimers {
    history: VecDeque<IterationTimers>,
    window: usize,
}

impl DeviceTimers {
    /// Window keeping the last `window` reports.
    pub fn new(window: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(window),
            window,
        }
    }

    /// Add a report, dropping the oldest beyond the window.
    pub fn record(&mut self, timers: IterationTimers) {
        self.history.push_back(timers);
        if self.history.len() > self.window {
            self.history.pop_front();
        }
    }

    /// Timers of the latest reported dispatch.
    pub fn last(&self) -> Option<&IterationTimers> {
        self.history.back()
    }

    /// Reports held.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// True before the first report.
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

/// Where a kernel sits in the split/merge/fail ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleMode {
    Uninitialized,
    /// Sub-kernels write disjoint regions along `dim`.
    Split { dim: usize },
    /// Every device runs its piece on a private copy; a merge pass follows.
    Merge { dim: usize },
    /// Single-device execution, terminal for this kernel.
    Fail { device: DeviceId },
}

impl ScheduleMode {
    /// Split dimension, if the mode has one.
    pub fn dim(&self) -> Option<usize> {
        match self {
            ScheduleMode::Split { dim } | ScheduleMode::Merge { dim } => Some(*dim),
            _ => None,
        }
    }

    /// Modes in which the granularity adapts.
    pub fn is_adaptive(&self) -> bool {
        matches!(self, ScheduleMode::Split { .. } | ScheduleMode::Merge { .. })
    }
}

/// Everything the scheduler remembers about one kernel between dispatches.
#[derive(Debug, Clone)]
pub struct SchedulingState {
    pub mode: ScheduleMode,
    /// Granularity the strategy asked for.
    pub requested: Granularity,
    /// Quantized granularity actually dispatched last time.
    pub legal: Granularity,
    pub timers: DeviceTimers,
    pub iteration: u64,
    pub best: BestTracker,
    pub converged: bool,
    /// Adaptation halted at the best granularity seen.
    pub frozen: bool,
}

impl SchedulingState {
    /// Fresh state that will start from `start`.
    pub fn new(start: Granularity, window: usize, patience: u32) -> Self {
        Self {
            mode: ScheduleMode::Uninitialized,
            requested: start.clone(),
            legal: start,
            timers: DeviceTimers::new(window),
            iteration: 0,
            best: BestTracker::new(patience),
            converged: false,
            frozen: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_shares_projects() {
        let g = Granularity::from_shares(&[-0.5, 2.0, 1.0]).unwrap();
        assert_eq!(g.shares(), &[0.0, 0.5, 0.5]);
        assert!(Granularity::from_shares(&[f64::NAN, 1.0]).is_none());
        assert!(Granularity::from_shares(&[0.0, -1.0]).is_none());
    }

    #[test]
    fn test_normalized_keeps_ratios() {
        // Weights above one must not be clipped before rescaling.
        let g = Granularity::normalized(&[1.0 / 0.15 * 0.5, 1.0 / 0.05 * 0.5]).unwrap();
        assert!((g.shares()[0] - 0.25).abs() < 1e-12);
        assert!((g.shares()[1] - 0.75).abs() < 1e-12);
        assert!(Granularity::normalized(&[2.0, -1.0]).is_none());
        assert!(Granularity::normalized(&[0.0, 0.0]).is_none());
    }

    #[test]
    fn test_dominant_and_distance() {
        let a = Granularity::from_shares(&[0.2, 0.5, 0.3]).unwrap();
        assert_eq!(a.dominant(), DeviceId(1));
        let b = Granularity::uniform(3);
        assert!((a.distance(&b) - (0.5 - 1.0 / 3.0)).abs() < 1e-12);
        assert_eq!(Granularity::uniform(2).dominant(), DeviceId(0));
    }

    #[test]
    fn test_device_times() {
        let t = IterationTimers::from_secs(&[1.0, 2.0], &[0.5, 0.0], &[0.0, 0.25]);
        assert_eq!(t.device_times(false), vec![1.0, 2.0]);
        assert_eq!(t.device_times(true), vec![1.5, 2.25]);
        assert_eq!(t.makespan(true), 2.25);
    }

    #[test]
    fn test_device_timers_window() {
        let mut timers = DeviceTimers::new(2);
        assert!(timers.last().is_none());
        for secs in [1.0, 3.0, 5.0] {
            timers.record(IterationTimers::from_secs(&[secs], &[0.0], &[0.0]));
        }
        assert_eq!(timers.len(), 2);
        assert_eq!(timers.last().unwrap().kernel[0].as_secs_f64(), 5.0);
    }
}
