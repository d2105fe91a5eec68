//! Per-kernel control loop.
//!
//! On the first dispatch a kernel is initialized by trying each split
//! dimension in descending order of parallelism; the first dimension whose
//! sub-partitions write disjoint regions wins. Without one the kernel runs
//! merged, and without a legal merge it fails over to a single device.
//! Afterwards every dispatch legalizes the requested granularity and every
//! timing report feeds the strategy.

use super::strategy::Strategy;
use super::{Granularity, IterationTimers, KernelId, ScheduleMode, SchedulingState};
use crate::config::Config;
use crate::device::DeviceId;
use crate::error::{Error, Fault, Result};
use crate::oracle::{AnalysisResult, ArgumentRegionOracle, KernelArg};
use crate::partition::{shares_of, WorkPartition};
use std::fmt;
use tracing::{debug, info, warn};

/// Scheduling knobs shared by every kernel.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub num_devices: usize,
    pub no_split: bool,
    pub skip_iterations: u32,
    pub start_granularity: Option<Granularity>,
    pub stop_at_best: bool,
    pub comm_aware: bool,
    pub tolerance: f64,
    pub stall_limit: u32,
    pub relaxation: f64,
    pub best_patience: u32,
    pub timer_window: usize,
}

impl From<&Config> for SchedulerSettings {
    fn from(config: &Config) -> Self {
        Self {
            num_devices: config.num_devices(),
            no_split: config.no_split,
            skip_iterations: config.skip_iterations,
            start_granularity: config
                .start_granularity
                .as_deref()
                .and_then(Granularity::from_shares),
            stop_at_best: config.stop_at_best,
            comm_aware: config.comm_aware,
            tolerance: config.tolerance,
            stall_limit: config.stall_limit,
            relaxation: config.relaxation,
            best_patience: config.best_patience,
            timer_window: config.timer_window,
        }
    }
}

impl SchedulerSettings {
    /// Default tuning for `num_devices` devices.
    pub fn for_devices(num_devices: usize) -> Self {
        let mut settings = Self::from(&Config::default());
        settings.num_devices = num_devices;
        settings
    }

    fn start(&self) -> Granularity {
        self.start_granularity
            .clone()
            .unwrap_or_else(|| Granularity::uniform(self.num_devices))
    }
}

/// What the driver runs for one dispatch.
#[derive(Debug, Clone)]
pub struct PartitionDecision {
    pub mode: ScheduleMode,
    /// Quantized shares actually dispatched.
    pub granularity: Granularity,
    /// One sub-partition per device; empty ones mean the device idles.
    pub subs: Vec<WorkPartition>,
    pub analysis: AnalysisResult,
    pub need_merge: bool,
    /// Faults recovered while deciding.
    pub faults: Vec<Fault>,
}

/// What one timing report changed.
#[derive(Debug, Clone, Default)]
pub struct ReportOutcome {
    pub makespan: f64,
    pub improved: bool,
    /// The report was eligible to drive adaptation.
    pub adapting: bool,
    pub converged: bool,
    pub frozen: bool,
    pub faults: Vec<Fault>,
}

/// Split, merge or fail ladder plus strategy for one kernel.
pub struct KernelScheduler {
    id: KernelId,
    name: String,
    oracle: Box<dyn ArgumentRegionOracle + Send>,
    args: Vec<KernelArg>,
    strategy: Option<Strategy>,
    state: SchedulingState,
    settings: SchedulerSettings,
}

impl fmt::Debug for KernelScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelScheduler")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("args", &self.args)
            .field("strategy", &self.strategy.as_ref().map(|s| s.kind()))
            .field("state", &self.state)
            .finish()
    }
}

impl KernelScheduler {
    /// `strategy` is `None` when an outer solver sets the granularity.
    pub fn new(
        id: KernelId,
        name: impl Into<String>,
        oracle: Box<dyn ArgumentRegionOracle + Send>,
        strategy: Option<Strategy>,
        settings: SchedulerSettings,
    ) -> Self {
        let state = SchedulingState::new(
            settings.start(),
            settings.timer_window,
            settings.best_patience,
        );
        Self {
            id,
            name: name.into(),
            oracle,
            args: Vec::new(),
            strategy,
            state,
            settings,
        }
    }

    /// Handle of the kernel.
    pub fn id(&self) -> KernelId {
        self.id
    }

    /// Name the kernel was created with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Argument values used by later analyses.
    pub fn set_args(&mut self, args: Vec<KernelArg>) {
        self.args = args;
    }

    /// Current argument values.
    pub fn args(&self) -> &[KernelArg] {
        &self.args
    }

    /// Scheduling state between dispatches.
    pub fn state(&self) -> &SchedulingState {
        &self.state
    }

    /// Per-kernel strategy, unless an outer solver drives this kernel.
    pub fn strategy(&self) -> Option<&Strategy> {
        self.strategy.as_ref()
    }

    /// Request a granularity from outside the strategy. Ignored once frozen.
    pub fn set_requested(&mut self, granularity: Granularity) {
        if !self.state.frozen && granularity.len() == self.settings.num_devices {
            self.state.requested = granularity;
        }
    }

    /// Decide the split for this dispatch.
    pub fn plan(&mut self, full: &WorkPartition) -> Result<PartitionDecision> {
        let mut faults = Vec::new();
        let decision = match self.state.mode {
            ScheduleMode::Uninitialized => self.initialize(full, &mut faults)?,
            ScheduleMode::Fail { device } => {
                let dim = full.dims_by_parallelism()[0];
                let single = Granularity::single(self.settings.num_devices, device);
                self.attempt(full, dim, &single, AttemptMode::Single, &mut faults)?
                    .ok_or_else(|| Error::invalid_partition("single-device split failed"))?
            }
            ScheduleMode::Split { dim } | ScheduleMode::Merge { dim } if dim >= full.work_dim() => {
                warn!(kernel = %self.name, dim, "partition lost its split dimension, re-initializing");
                self.state.mode = ScheduleMode::Uninitialized;
                self.initialize(full, &mut faults)?
            }
            ScheduleMode::Split { dim } | ScheduleMode::Merge { dim } => {
                let kind = match self.state.mode {
                    ScheduleMode::Merge { .. } => AttemptMode::Merge,
                    _ => AttemptMode::Split,
                };
                let requested = self.state.requested.clone();
                let legal = self.state.legal.clone();
                match self.attempt(full, dim, &requested, kind, &mut faults)? {
                    Some(d) => d,
                    None => match self.attempt(full, dim, &legal, kind, &mut faults)? {
                        Some(d) => {
                            debug!(kernel = %self.name, granularity = %legal, "kept previous legal granularity");
                            self.state.requested = legal;
                            d
                        }
                        None => {
                            warn!(kernel = %self.name, "previous granularity no longer legal, re-initializing");
                            self.state.mode = ScheduleMode::Uninitialized;
                            self.initialize(full, &mut faults)?
                        }
                    },
                }
            }
        };

        self.state.legal = decision.granularity.clone();
        Ok(PartitionDecision { faults, ..decision })
    }

    fn initialize(
        &mut self,
        full: &WorkPartition,
        faults: &mut Vec<Fault>,
    ) -> Result<PartitionDecision> {
        let n = self.settings.num_devices;
        let start = self.state.requested.clone();
        let dims = full.dims_by_parallelism();

        if n == 1 || self.settings.no_split {
            let device = start.dominant();
            return self.enter_fail(full, device, faults);
        }

        for &dim in &dims {
            if let Some(d) = self.attempt(full, dim, &start, AttemptMode::Split, faults)? {
                info!(kernel = %self.name, dim, granularity = %d.granularity, "split");
                self.state.mode = d.mode;
                return Ok(d);
            }
        }

        if let Some(d) = self.attempt(full, dims[0], &start, AttemptMode::Merge, faults)? {
            info!(kernel = %self.name, dim = dims[0], "no disjoint split, merging");
            self.state.mode = d.mode;
            return Ok(d);
        }

        let device = self.state.legal.dominant();
        self.enter_fail(full, device, faults)
    }

    fn enter_fail(
        &mut self,
        full: &WorkPartition,
        device: DeviceId,
        faults: &mut Vec<Fault>,
    ) -> Result<PartitionDecision> {
        info!(kernel = %self.name, %device, "running on a single device");
        let dim = full.dims_by_parallelism()[0];
        let single = Granularity::single(self.settings.num_devices, device);
        let d = self
            .attempt(full, dim, &single, AttemptMode::Single, faults)?
            .ok_or_else(|| Error::invalid_partition("single-device split failed"))?;
        self.state.mode = d.mode;
        self.state.requested = d.granularity.clone();
        Ok(d)
    }

    /// Quantize `granularity` along `dim` and check it. `None` when illegal.
    fn attempt(
        &self,
        full: &WorkPartition,
        dim: usize,
        granularity: &Granularity,
        kind: AttemptMode,
        faults: &mut Vec<Fault>,
    ) -> Result<Option<PartitionDecision>> {
        let subs = full.split_dim(dim, granularity.shares())?;
        let analysis = match self.oracle.analyze(&self.args, full, &subs) {
            Ok(a) => a,
            Err(e) => {
                debug!(kernel = %self.name, error = %e, "oracle gave up");
                if !faults.contains(&Fault::OracleUnknown) {
                    faults.push(Fault::OracleUnknown);
                }
                self.oracle.fallback(&self.args, full, &subs)
            }
        };

        let (legal, mode) = match kind {
            AttemptMode::Split => (analysis.can_split, ScheduleMode::Split { dim }),
            AttemptMode::Merge => (analysis.merge_legal(), ScheduleMode::Merge { dim }),
            AttemptMode::Single => {
                let device = granularity.dominant();
                (true, ScheduleMode::Fail { device })
            }
        };
        if !legal {
            faults.push(Fault::LegalizationFailure {
                dim,
                granularity: granularity.shares().to_vec(),
            });
            return Ok(None);
        }

        let quantized = Granularity::from_shares(&shares_of(full, &subs, dim))
            .unwrap_or_else(|| granularity.clone());
        Ok(Some(PartitionDecision {
            mode,
            granularity: quantized,
            subs,
            analysis,
            need_merge: kind == AttemptMode::Merge,
            faults: Vec::new(),
        }))
    }

    /// Feed the times measured for the last dispatch.
    pub fn report(&mut self, timers: IterationTimers) -> Result<ReportOutcome> {
        let n = self.settings.num_devices;
        if !timers.is_consistent() || timers.num_devices() != n {
            let got = [timers.kernel.len(), timers.h2d.len(), timers.d2h.len()]
                .into_iter()
                .find(|len| *len != n)
                .unwrap_or(n);
            return Err(Error::DeviceCountMismatch { expected: n, got });
        }

        let comm_aware = self.settings.comm_aware;
        let times = timers.device_times(comm_aware);
        let makespan = timers.makespan(comm_aware);
        self.state.timers.record(timers);
        self.state.iteration += 1;

        let mut outcome = ReportOutcome {
            makespan,
            improved: self.state.best.observe(&self.state.legal, makespan),
            ..ReportOutcome::default()
        };

        if !self.state.mode.is_adaptive() || self.state.frozen {
            return Ok(outcome);
        }
        if self.state.iteration <= u64::from(self.settings.skip_iterations) {
            debug!(kernel = %self.name, iteration = self.state.iteration, "skipping adaptation");
            return Ok(outcome);
        }

        if self.settings.stop_at_best && self.state.best.stalled() {
            if let Some((best, t)) = self.state.best.best() {
                info!(kernel = %self.name, granularity = %best, makespan = t, "frozen at best granularity");
                self.state.requested = best.clone();
            }
            self.state.frozen = true;
            outcome.frozen = true;
            return Ok(outcome);
        }

        outcome.adapting = true;
        let strategy = match self.strategy.as_mut() {
            Some(s) => s,
            None => return Ok(outcome),
        };

        let step = strategy.next_granularity(&self.state.legal, &times);
        if let Some(fault) = step.fault {
            warn!(kernel = %self.name, %fault, "recovered");
            outcome.faults.push(fault);
        }
        if step.converged && !self.state.converged {
            info!(kernel = %self.name, granularity = %step.granularity, iteration = self.state.iteration, "converged");
            outcome.converged = true;
        }
        self.state.converged = step.converged;
        self.state.requested = step.granularity;
        Ok(outcome)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptMode {
    Split,
    Merge,
    Single,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coherence::BufferId;
    use crate::config::StrategyKind;
    use crate::oracle::{AccessMode, AccessPattern, AffineOracle, OracleError};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn scheduler(oracle: AffineOracle, args: Vec<KernelArg>, settings: SchedulerSettings) -> KernelScheduler {
        let strategy = Strategy::new(StrategyKind::Broyden, &settings);
        let mut s = KernelScheduler::new(KernelId(0), "k", Box::new(oracle), strategy, settings);
        s.set_args(args);
        s
    }

    fn vector_add() -> (AffineOracle, Vec<KernelArg>) {
        let oracle = AffineOracle::new()
            .access(0, AccessMode::Read, AccessPattern::row_major(4, 0, 0))
            .access(1, AccessMode::Write, AccessPattern::row_major(4, 0, 0));
        (oracle, vec![KernelArg::Buffer(BufferId(0)), KernelArg::Buffer(BufferId(1))])
    }

    fn accumulator(mode: AccessMode) -> AffineOracle {
        AffineOracle::new().access(
            0,
            mode,
            AccessPattern::Affine {
                elem_size: 8,
                base: 0,
                offset_arg: None,
                strides: [0, 0, 0],
                halo: 0,
            },
        )
    }

    #[test]
    fn test_first_dispatch_splits() {
        let (oracle, args) = vector_add();
        let mut s = scheduler(oracle, args, SchedulerSettings::for_devices(2));
        let full = WorkPartition::new(&[1024], &[64]).unwrap();
        let d = s.plan(&full).unwrap();
        assert_eq!(d.mode, ScheduleMode::Split { dim: 0 });
        assert_eq!(d.subs.len(), 2);
        assert_eq!(d.subs[0].global_size()[0], 512);
        assert!(!d.need_merge);
        assert!(d.faults.is_empty());
    }

    #[test]
    fn test_falls_back_to_next_dimension() {
        // Every row writes the same column slice: dim 0 overlaps, dim 1 does not.
        let oracle = AffineOracle::new().access(
            0,
            AccessMode::Write,
            AccessPattern::Affine {
                elem_size: 4,
                base: 0,
                offset_arg: None,
                strides: [0, 1, 0],
                halo: 0,
            },
        );
        let mut s = scheduler(oracle, vec![KernelArg::Buffer(BufferId(0))], SchedulerSettings::for_devices(2));
        let full = WorkPartition::new(&[64, 16], &[8, 4]).unwrap();
        let d = s.plan(&full).unwrap();
        assert_eq!(d.mode, ScheduleMode::Split { dim: 1 });
        assert!(matches!(d.faults[0], Fault::LegalizationFailure { dim: 0, .. }));
    }

    #[test]
    fn test_write_only_overlap_merges() {
        let mut s = scheduler(
            accumulator(AccessMode::Write),
            vec![KernelArg::Buffer(BufferId(0))],
            SchedulerSettings::for_devices(2),
        );
        let full = WorkPartition::new(&[64], &[8]).unwrap();
        let d = s.plan(&full).unwrap();
        assert_eq!(d.mode, ScheduleMode::Merge { dim: 0 });
        assert!(d.need_merge);
    }

    #[test]
    fn test_read_write_overlap_fails_over() {
        let mut s = scheduler(
            accumulator(AccessMode::ReadWrite),
            vec![KernelArg::Buffer(BufferId(0))],
            SchedulerSettings::for_devices(2),
        );
        let full = WorkPartition::new(&[64], &[8]).unwrap();
        let d = s.plan(&full).unwrap();
        assert_eq!(d.mode, ScheduleMode::Fail { device: DeviceId(0) });
        assert_eq!(d.subs[0].total_items(), 64);
        assert!(d.subs[1].is_empty());

        // Terminal: timings never move it.
        s.report(IterationTimers::from_secs(&[1.0, 0.0], &[0.0, 0.0], &[0.0, 0.0]))
            .unwrap();
        assert_eq!(s.plan(&full).unwrap().mode, ScheduleMode::Fail { device: DeviceId(0) });
    }

    #[test]
    fn test_unknown_bounds_fail_over() {
        let oracle = AffineOracle::new().access(0, AccessMode::Write, AccessPattern::Unknown);
        let mut s = scheduler(oracle, vec![KernelArg::Buffer(BufferId(0))], SchedulerSettings::for_devices(2));
        let full = WorkPartition::new(&[64], &[8]).unwrap();
        let d = s.plan(&full).unwrap();
        assert!(matches!(d.mode, ScheduleMode::Fail { .. }));
        assert!(d.faults.contains(&Fault::OracleUnknown));
        assert!(d.analysis.arguments[0].per_sub[0].write.is_undefined());
        assert!(d.analysis.arguments[0].per_sub[1].write.is_empty());
    }

    /// Vector add whose splits are legal only while every device keeps at
    /// least `min_share` of the items.
    #[derive(Debug)]
    struct MinShareOracle {
        inner: AffineOracle,
        min_share: Arc<Mutex<f64>>,
    }

    impl ArgumentRegionOracle for MinShareOracle {
        fn analyze(
            &self,
            args: &[KernelArg],
            full: &WorkPartition,
            subs: &[WorkPartition],
        ) -> std::result::Result<AnalysisResult, OracleError> {
            let mut result = self.inner.analyze(args, full, subs)?;
            let min = *self.min_share.lock();
            let total = full.total_items() as f64;
            result.can_split &= subs.iter().all(|s| s.total_items() as f64 / total >= min);
            Ok(result)
        }
    }

    fn min_share_scheduler(min_share: f64) -> (KernelScheduler, Arc<Mutex<f64>>) {
        let (inner, args) = vector_add();
        let knob = Arc::new(Mutex::new(min_share));
        let oracle = MinShareOracle {
            inner,
            min_share: Arc::clone(&knob),
        };
        let settings = SchedulerSettings::for_devices(2);
        let strategy = Strategy::new(StrategyKind::Broyden, &settings);
        let mut s = KernelScheduler::new(KernelId(0), "k", Box::new(oracle), strategy, settings);
        s.set_args(args);
        (s, knob)
    }

    #[test]
    fn test_illegal_request_keeps_previous() {
        let (mut s, _) = min_share_scheduler(0.3);
        let full = WorkPartition::new(&[1024], &[64]).unwrap();
        assert_eq!(s.plan(&full).unwrap().mode, ScheduleMode::Split { dim: 0 });

        let skewed = Granularity::from_shares(&[0.1, 0.9]).unwrap();
        s.set_requested(skewed.clone());
        let d = s.plan(&full).unwrap();
        assert_eq!(d.mode, ScheduleMode::Split { dim: 0 });
        assert_eq!(d.granularity, Granularity::uniform(2));
        assert_eq!(
            d.faults,
            vec![Fault::LegalizationFailure {
                dim: 0,
                granularity: skewed.shares().to_vec(),
            }]
        );
        assert_eq!(s.state().requested, Granularity::uniform(2));
        assert_eq!(s.state().legal, Granularity::uniform(2));
    }

    #[test]
    fn test_lost_legality_reinitializes() {
        let (mut s, knob) = min_share_scheduler(0.3);
        let full = WorkPartition::new(&[1024], &[64]).unwrap();
        assert_eq!(s.plan(&full).unwrap().mode, ScheduleMode::Split { dim: 0 });

        // No two-way split can give both devices 60%.
        *knob.lock() = 0.6;
        s.set_requested(Granularity::from_shares(&[0.4, 0.6]).unwrap());
        let d = s.plan(&full).unwrap();
        assert_eq!(d.mode, ScheduleMode::Merge { dim: 0 });
        assert!(d.need_merge);
        let failures = d
            .faults
            .iter()
            .filter(|f| matches!(f, Fault::LegalizationFailure { .. }))
            .count();
        // requested, previous legal, then the fresh split attempt
        assert_eq!(failures, 3);
        assert_eq!(s.state().mode, ScheduleMode::Merge { dim: 0 });
    }

    #[test]
    fn test_no_split_uses_dominant_start() {
        let (oracle, args) = vector_add();
        let mut settings = SchedulerSettings::for_devices(2);
        settings.no_split = true;
        settings.start_granularity = Granularity::from_shares(&[0.2, 0.8]);
        let mut s = scheduler(oracle, args, settings);
        let d = s.plan(&WorkPartition::new(&[128], &[16]).unwrap()).unwrap();
        assert_eq!(d.mode, ScheduleMode::Fail { device: DeviceId(1) });
    }

    #[test]
    fn test_adapts_after_skip() {
        let (oracle, args) = vector_add();
        let mut settings = SchedulerSettings::for_devices(2);
        settings.skip_iterations = 2;
        let mut s = scheduler(oracle, args, settings);
        let full = WorkPartition::new(&[1024], &[16]).unwrap();

        for _ in 0..2 {
            s.plan(&full).unwrap();
            let out = s
                .report(IterationTimers::from_secs(&[0.3, 0.1], &[0.0, 0.0], &[0.0, 0.0]))
                .unwrap();
            assert!(!out.adapting);
            assert_eq!(s.state().requested, Granularity::uniform(2));
        }
        s.plan(&full).unwrap();
        let out = s
            .report(IterationTimers::from_secs(&[0.3, 0.1], &[0.0, 0.0], &[0.0, 0.0]))
            .unwrap();
        assert!(out.adapting);
        assert!((s.state().requested.shares()[0] - 0.25).abs() < 1e-9);

        // Quantized to whole work-groups: 16 of 64 groups.
        let d = s.plan(&full).unwrap();
        assert_eq!(d.subs[0].global_size()[0], 256);
    }

    #[test]
    fn test_stop_at_best_freezes() {
        let (oracle, args) = vector_add();
        let mut settings = SchedulerSettings::for_devices(2);
        settings.stop_at_best = true;
        settings.best_patience = 2;
        let mut s = scheduler(oracle, args, settings);
        let full = WorkPartition::new(&[1024], &[16]).unwrap();

        let first = s.plan(&full).unwrap().granularity;
        s.report(IterationTimers::from_secs(&[0.1, 0.1], &[0.0, 0.0], &[0.0, 0.0]))
            .unwrap();
        let mut frozen = false;
        for _ in 0..4 {
            s.plan(&full).unwrap();
            let out = s
                .report(IterationTimers::from_secs(&[0.5, 0.5], &[0.0, 0.0], &[0.0, 0.0]))
                .unwrap();
            frozen |= out.frozen;
        }
        assert!(frozen);
        assert!(s.state().frozen);
        assert_eq!(s.state().requested, first);
        assert_eq!(s.plan(&full).unwrap().granularity, first);
    }

    #[test]
    fn test_timer_length_mismatch() {
        let (oracle, args) = vector_add();
        let mut s = scheduler(oracle, args, SchedulerSettings::for_devices(2));
        let err = s.report(IterationTimers::from_secs(&[0.1], &[0.0], &[0.0]));
        assert!(matches!(err, Err(Error::DeviceCountMismatch { expected: 2, got: 1 })));
    }
}
