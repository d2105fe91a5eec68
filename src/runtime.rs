//! Driver-facing context.
//!
//! A [`Runtime`] owns the coherence state of every registered buffer and the
//! scheduling state of every kernel. The interception layer calls
//! [`Runtime::get_partition`] before each launch and
//! [`Runtime::report_iteration_timers`] once the launch has drained.

use crate::coherence::{BufferId, BufferManager, BufferRequest, TransferPlan};
use crate::config::{Config, StrategyKind};
use crate::device::{DeviceId, DeviceSet};
use crate::error::{Error, Result};
use crate::oracle::{ArgumentRegionOracle, KernelArg};
use crate::partition::WorkPartition;
use crate::region::RegionSet;
use crate::scheduler::{
    CycleScheduler, Granularity, IterationTimers, KernelId, KernelScheduler, ScheduleMode,
    SchedulerSettings, SchedulingState, Strategy,
};
use crate::telemetry::{Metrics, ScheduleTrace, TraceEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One device's share of a launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubKernel {
    pub device: DeviceId,
    /// Context the device belongs to under the configured platform grouping.
    pub context: usize,
    pub partition: WorkPartition,
}

/// Bytes a device writes during the launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenRegion {
    pub buffer: BufferId,
    pub device: DeviceId,
    pub region: RegionSet,
}

/// Everything the driver needs to issue one dispatch.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub kernel: KernelId,
    pub mode: ScheduleMode,
    pub granularity: Granularity,
    /// One entry per device, in device order. Empty partitions are skipped
    /// by the driver.
    pub sub_kernels: Vec<SubKernel>,
    /// Device-to-host copies first, then host-to-device copies.
    pub transfers: TransferPlan,
    pub written: Vec<WrittenRegion>,
    /// Sub-kernels wrote private copies; a merge pass must combine them on
    /// the host before the next dispatch.
    pub need_another_pass: bool,
}

impl DispatchPlan {
    /// Sub-kernels that have work this iteration.
    pub fn active(&self) -> impl Iterator<Item = &SubKernel> {
        self.sub_kernels.iter().filter(|s| !s.partition.is_empty())
    }
}

#[derive(Debug)]
struct KernelEntry {
    scheduler: KernelScheduler,
    pending: bool,
}

/// Partitioning context for one set of devices.
#[derive(Debug)]
pub struct Runtime {
    config: Config,
    devices: DeviceSet,
    settings: SchedulerSettings,
    buffers: BufferManager,
    kernels: HashMap<KernelId, KernelEntry>,
    cycle: Option<CycleScheduler>,
    next_kernel: u64,
    metrics: Arc<Metrics>,
    trace: Option<ScheduleTrace>,
}

impl Runtime {
    /// Runtime for a validated `config`.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let devices = config.device_set();
        let settings = SchedulerSettings::from(&config);
        let cycle = match (config.strategy, config.cycle_length) {
            (StrategyKind::MkgrLp, Some(len)) => Some(CycleScheduler::new(
                len,
                devices.len(),
                config.ewma_alpha,
                config.comm_aware,
            )?),
            _ => None,
        };

        info!(
            devices = devices.len(),
            contexts = devices.context_count(),
            strategy = config.strategy.name(),
            policy = ?config.buffer_policy,
            "runtime ready"
        );

        Ok(Self {
            buffers: BufferManager::new(config.buffer_policy, devices.len()),
            trace: config.record_trace.then(ScheduleTrace::new),
            config,
            devices,
            settings,
            kernels: HashMap::new(),
            cycle,
            next_kernel: 0,
            metrics: Arc::new(Metrics::new()),
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Configured devices.
    pub fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    /// Coherence state of every buffer.
    pub fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    /// Shared dispatch counters.
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Recorded schedule, when tracing is enabled.
    pub fn trace(&self) -> Option<&ScheduleTrace> {
        self.trace.as_ref()
    }

    /// Cycle scheduler, when the cycle LP strategy is active.
    pub fn cycle(&self) -> Option<&CycleScheduler> {
        self.cycle.as_ref()
    }

    // Buffers

    /// Track a new buffer of `size` bytes, valid on the host.
    pub fn register_buffer(&mut self, id: BufferId, size: u64) -> Result<()> {
        self.buffers.register_buffer(id, size)
    }

    /// Limit the tracked extent of a buffer.
    pub fn set_max_used_size(&mut self, id: BufferId, max_used: Option<u64>) -> Result<()> {
        self.buffers.set_max_used_size(id, max_used)
    }

    /// Stop tracking a buffer.
    pub fn release_buffer(&mut self, id: BufferId) -> Result<()> {
        self.buffers.release_buffer(id)
    }

    /// The application wrote `region` of `id` on the host.
    pub fn host_write(&mut self, id: BufferId, region: &RegionSet) -> Result<()> {
        self.buffers.host_write(id, region)
    }

    /// Copies to issue before the application reads `region` on the host.
    pub fn host_read(&mut self, id: BufferId, region: &RegionSet) -> Result<TransferPlan> {
        match self.buffers.host_read(id, region) {
            Ok(plan) => {
                self.metrics.record_transfers(&plan);
                Ok(plan)
            }
            Err(e) => Err(self.observe_error(e)),
        }
    }

    // Kernels

    /// Register a kernel whose accesses `oracle` describes.
    pub fn create_kernel<O>(&mut self, name: impl Into<String>, oracle: O) -> KernelId
    where
        O: ArgumentRegionOracle + Send + 'static,
    {
        let id = KernelId(self.next_kernel);
        self.next_kernel += 1;
        let name = name.into();

        let strategy = match self.cycle.as_mut().map(|c| c.admit(id)) {
            Some(Some(position)) => {
                debug!(kernel = %name, position, "joined cycle");
                None
            }
            Some(None) => {
                warn!(kernel = %name, "cycle is full, scheduling kernel on its own");
                Strategy::new(StrategyKind::Broyden, &self.settings)
            }
            None => Strategy::new(self.config.strategy, &self.settings),
        };

        let scheduler = KernelScheduler::new(id, name, Box::new(oracle), strategy, self.settings.clone());
        self.kernels.insert(
            id,
            KernelEntry {
                scheduler,
                pending: false,
            },
        );
        id
    }

    /// Argument values for the next dispatches of `id`.
    pub fn set_kernel_args(&mut self, id: KernelId, args: Vec<KernelArg>) -> Result<()> {
        self.entry_mut(id)?.scheduler.set_args(args);
        Ok(())
    }

    /// Forget a kernel and its scheduling state.
    pub fn release_kernel(&mut self, id: KernelId) -> Result<()> {
        let entry = self.kernels.remove(&id).ok_or(Error::UnknownKernel(id))?;
        debug!(kernel = %entry.scheduler.name(), iterations = entry.scheduler.state().iteration, "released kernel");
        Ok(())
    }

    /// Scheduler of a registered kernel.
    pub fn kernel(&self, id: KernelId) -> Option<&KernelScheduler> {
        self.kernels.get(&id).map(|e| &e.scheduler)
    }

    /// Scheduling state of a registered kernel.
    pub fn scheduling_state(&self, id: KernelId) -> Option<&SchedulingState> {
        self.kernel(id).map(KernelScheduler::state)
    }

    fn entry_mut(&mut self, id: KernelId) -> Result<&mut KernelEntry> {
        self.kernels.get_mut(&id).ok_or(Error::UnknownKernel(id))
    }

    /// Split `full` across the devices and plan the copies the split needs.
    ///
    /// A [`Error::Consistency`] failure aborts the dispatch with every
    /// buffer's coherence state unchanged.
    pub fn get_partition(&mut self, id: KernelId, full: &WorkPartition) -> Result<DispatchPlan> {
        let n = self.devices.len();
        let entry = self.kernels.get_mut(&id).ok_or(Error::UnknownKernel(id))?;
        if entry.pending {
            warn!(kernel = %entry.scheduler.name(), "previous dispatch never reported timers");
        }

        let before = entry.scheduler.state().mode;
        let decision = entry.scheduler.plan(full)?;
        for fault in &decision.faults {
            self.metrics.record_fault(fault);
        }

        let mut requests = Vec::new();
        let mut written = Vec::new();
        for (buffer, subs) in decision.analysis.per_buffer() {
            let writes: Vec<RegionSet> = subs.iter().map(|a| a.write.clone()).collect();
            for (d, w) in writes.iter().enumerate() {
                if !w.is_empty() {
                    written.push(WrittenRegion {
                        buffer,
                        device: DeviceId(d),
                        region: w.clone(),
                    });
                }
            }
            let (device_writes, merged) = if decision.need_merge {
                let merged = writes.iter().fold(RegionSet::new(), |acc, w| acc.union(w));
                (vec![RegionSet::new(); n], merged)
            } else {
                (writes, RegionSet::new())
            };
            requests.push(BufferRequest {
                buffer,
                required: subs.iter().map(|a| a.required()).collect(),
                written: device_writes,
                merged,
            });
        }

        let transfers = match self.buffers.plan_dispatch(&requests) {
            Ok(plan) => plan,
            Err(e) => return Err(self.observe_error(e)),
        };

        // Re-borrow: the buffer manager call above needed `self`.
        let entry = self.kernels.get_mut(&id).ok_or(Error::UnknownKernel(id))?;
        entry.pending = true;
        let iteration = entry.scheduler.state().iteration;

        self.metrics.record_dispatch(&transfers, decision.need_merge);
        if let Some(trace) = self.trace.as_mut() {
            if before != decision.mode {
                trace.push(TraceEvent::ModeChange {
                    kernel: id,
                    from: before,
                    to: decision.mode,
                });
            }
            trace.push(TraceEvent::Dispatch {
                kernel: id,
                iteration,
                mode: decision.mode,
                granularity: decision.granularity.clone(),
                h2d_bytes: transfers.h2d_bytes(),
                d2h_bytes: transfers.d2h_bytes(),
            });
        }

        let devices = &self.devices;
        let sub_kernels = decision
            .subs
            .into_iter()
            .enumerate()
            .map(|(d, partition)| SubKernel {
                device: DeviceId(d),
                context: devices.context_of(DeviceId(d)).unwrap_or(d),
                partition,
            })
            .collect();

        Ok(DispatchPlan {
            kernel: id,
            mode: decision.mode,
            granularity: decision.granularity,
            sub_kernels,
            transfers,
            written,
            need_another_pass: decision.need_merge,
        })
    }

    /// Per-device times measured for the kernel's last dispatch.
    pub fn report_iteration_timers(&mut self, id: KernelId, timers: IterationTimers) -> Result<()> {
        let comm_aware = self.config.comm_aware;
        let entry = self.kernels.get_mut(&id).ok_or(Error::UnknownKernel(id))?;
        if !entry.pending {
            return Err(Error::NoPendingDispatch(id));
        }

        let device_times = timers.device_times(comm_aware);
        let outcome = entry.scheduler.report(timers.clone())?;
        entry.pending = false;
        let state = entry.scheduler.state();

        self.metrics.record_makespan(outcome.makespan);
        for fault in &outcome.faults {
            self.metrics.record_fault(fault);
        }
        if let Some(trace) = self.trace.as_mut() {
            trace.push(TraceEvent::Timing {
                kernel: id,
                iteration: state.iteration,
                device_times,
                makespan: outcome.makespan,
            });
            if outcome.converged {
                trace.push(TraceEvent::Converged {
                    kernel: id,
                    iteration: state.iteration,
                    granularity: state.requested.clone(),
                });
            }
            if outcome.frozen {
                trace.push(TraceEvent::Frozen {
                    kernel: id,
                    granularity: state.requested.clone(),
                });
            }
        }

        if outcome.adapting {
            self.advance_cycle(id, &timers);
        }
        Ok(())
    }

    fn advance_cycle(&mut self, id: KernelId, timers: &IterationTimers) {
        let cycle = match self.cycle.as_mut() {
            Some(c) => c,
            None => return,
        };
        let position = match cycle.position(id) {
            Some(p) => p,
            None => return,
        };
        let legal: Option<Vec<Granularity>> = cycle
            .members()
            .iter()
            .map(|k| self.kernels.get(k).map(|e| e.scheduler.state().legal.clone()))
            .collect();
        let legal = match legal {
            Some(l) => l,
            None => {
                debug!("a cycle member was released, cycle model frozen");
                return;
            }
        };

        let outcome = cycle.report(position, &legal, timers);
        if let Some(fault) = &outcome.fault {
            self.metrics.record_fault(fault);
        }
        if let Some(solution) = outcome.solution {
            self.metrics.record_cycle_solve();
            for (k, g) in cycle.members().iter().zip(&solution.granularities) {
                if let Some(entry) = self.kernels.get_mut(k) {
                    entry.scheduler.set_requested(g.clone());
                }
            }
            if let Some(trace) = self.trace.as_mut() {
                trace.push(TraceEvent::CycleSolved {
                    objective: solution.objective,
                    granularities: solution.granularities,
                });
            }
        }
    }

    fn observe_error(&self, e: Error) -> Error {
        if let Error::Consistency { buffer, location, missing } = &e {
            self.metrics.record_consistency_error();
            error!(%buffer, %location, %missing, "no valid copy, aborting");
        }
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{AccessMode, AccessPattern, AffineOracle};

    fn copy_kernel() -> AffineOracle {
        AffineOracle::new()
            .access(0, AccessMode::Read, AccessPattern::row_major(4, 0, 0))
            .access(1, AccessMode::Write, AccessPattern::row_major(4, 0, 0))
    }

    fn runtime() -> Runtime {
        let mut rt = Runtime::new(Config::default()).unwrap();
        rt.register_buffer(BufferId(0), 4096).unwrap();
        rt.register_buffer(BufferId(1), 4096).unwrap();
        rt
    }

    #[test]
    fn test_dispatch_plan() {
        let mut rt = runtime();
        let k = rt.create_kernel("copy", copy_kernel());
        rt.set_kernel_args(k, vec![KernelArg::Buffer(BufferId(0)), KernelArg::Buffer(BufferId(1))])
            .unwrap();

        let plan = rt.get_partition(k, &WorkPartition::new(&[1024], &[64]).unwrap()).unwrap();
        assert_eq!(plan.sub_kernels.len(), 2);
        assert_eq!(plan.active().count(), 2);
        assert!(!plan.need_another_pass);
        // Each device uploads its half of both buffers.
        assert_eq!(plan.transfers.h2d_bytes(), 2 * 4096);
        assert!(plan.transfers.d2h.is_empty());
        assert_eq!(plan.written.len(), 2);
        assert_eq!(plan.written[1].region, RegionSet::from(crate::region::Interval::new(2048, 4095)));
    }

    #[test]
    fn test_report_requires_pending_dispatch() {
        let mut rt = runtime();
        let k = rt.create_kernel("copy", copy_kernel());
        let timers = IterationTimers::from_secs(&[0.1, 0.1], &[0.0, 0.0], &[0.0, 0.0]);
        assert!(matches!(
            rt.report_iteration_timers(k, timers.clone()),
            Err(Error::NoPendingDispatch(_))
        ));
        assert!(matches!(
            rt.report_iteration_timers(KernelId(99), timers),
            Err(Error::UnknownKernel(_))
        ));
    }

    #[test]
    fn test_unregistered_buffer() {
        let mut rt = runtime();
        let k = rt.create_kernel("copy", copy_kernel());
        rt.set_kernel_args(k, vec![KernelArg::Buffer(BufferId(0)), KernelArg::Buffer(BufferId(7))])
            .unwrap();
        let err = rt.get_partition(k, &WorkPartition::new(&[64], &[8]).unwrap());
        assert!(matches!(err, Err(Error::UnknownBuffer(BufferId(7)))));
    }

    #[test]
    fn test_release_kernel() {
        let mut rt = runtime();
        let k = rt.create_kernel("copy", copy_kernel());
        assert!(rt.scheduling_state(k).is_some());
        rt.release_kernel(k).unwrap();
        assert!(rt.scheduling_state(k).is_none());
        assert!(rt.release_kernel(k).is_err());
    }
}
