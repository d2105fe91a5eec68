//! Telemetry and observability subsystem.
//!
//! Counters and a makespan histogram for every dispatch, JSON export, and an
//! optional per-dispatch schedule trace.

#[cfg(feature = "telemetry")]
pub mod metrics;

#[cfg(feature = "telemetry")]
pub mod export;

pub mod trace;

#[cfg(feature = "telemetry")]
pub use metrics::{Metrics, MetricsSnapshot};

#[cfg(feature = "telemetry")]
pub use export::{JsonExporter, MetricsExporter};

pub use trace::{ScheduleTrace, TraceEvent};

// Stub implementations when telemetry is disabled
/// No-op counters used when the `telemetry` feature is off.
#[cfg(not(feature = "telemetry"))]
pub mod metrics {
    use crate::coherence::TransferPlan;
    use crate::error::Fault;
    use std::time::Duration;

    #[derive(Debug, Clone, Default)]
    pub struct Metrics;

    impl Metrics {
        pub fn new() -> Self { Self }
        pub fn record_dispatch(&self, _: &TransferPlan, _: bool) {}
        pub fn record_transfers(&self, _: &TransferPlan) {}
        pub fn record_fault(&self, _: &Fault) {}
        pub fn record_consistency_error(&self) {}
        pub fn record_cycle_solve(&self) {}
        pub fn record_makespan(&self, _: f64) {}
        pub fn snapshot(&self) -> MetricsSnapshot { MetricsSnapshot::default() }
        pub fn reset(&self) {}
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct MetricsSnapshot {
        pub uptime: Duration,
        pub dispatches: u64,
        pub d2h_bytes: u64,
        pub h2d_bytes: u64,
    }
}

#[cfg(not(feature = "telemetry"))]
pub use metrics::{Metrics, MetricsSnapshot};
