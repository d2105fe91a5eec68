//! Common imports.

pub use crate::coherence::{BufferId, BufferManager, Direction, Transfer, TransferPlan};
pub use crate::config::{BufferPolicy, Config, ConfigBuilder, StrategyKind};
pub use crate::device::{DeviceId, DeviceKind, DeviceSpec, PlatformGrouping};
pub use crate::error::{Error, Fault, Result};
pub use crate::oracle::{
    AccessMode, AccessPattern, AffineOracle, AnalysisResult, ArgumentRegionOracle, KernelArg,
};
pub use crate::partition::WorkPartition;
pub use crate::region::{Interval, RegionSet};
pub use crate::runtime::{DispatchPlan, Runtime, SubKernel, WrittenRegion};
pub use crate::scheduler::{Granularity, IterationTimers, KernelId, ScheduleMode};

#[cfg(feature = "telemetry")]
pub use crate::telemetry::{Metrics, MetricsSnapshot};

pub use crate::telemetry::{ScheduleTrace, TraceEvent};
