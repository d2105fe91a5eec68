//! Dispatch and transfer counters.

use crate::coherence::TransferPlan;
use crate::error::Fault;
use hdrhistogram::Histogram;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// One hour in nanoseconds.
const MAX_MAKESPAN_NS: u64 = 3_600_000_000_000;

/// Runtime metrics collector
#[derive(Debug)]
pub struct Metrics {
    dispatches: AtomicU64,
    merge_dispatches: AtomicU64,

    d2h_transfers: AtomicU64,
    h2d_transfers: AtomicU64,
    d2h_bytes: AtomicU64,
    h2d_bytes: AtomicU64,
    staged_bytes: AtomicU64,

    legalization_failures: AtomicU64,
    numeric_degenerate: AtomicU64,
    oracle_unknown: AtomicU64,
    consistency_errors: AtomicU64,
    cycle_solves: AtomicU64,

    // Makespan per reported iteration, in nanoseconds
    makespan: RwLock<Option<Histogram<u64>>>,

    start_time: Instant,
}

impl Metrics {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self {
            dispatches: AtomicU64::new(0),
            merge_dispatches: AtomicU64::new(0),
            d2h_transfers: AtomicU64::new(0),
            h2d_transfers: AtomicU64::new(0),
            d2h_bytes: AtomicU64::new(0),
            h2d_bytes: AtomicU64::new(0),
            staged_bytes: AtomicU64::new(0),
            legalization_failures: AtomicU64::new(0),
            numeric_degenerate: AtomicU64::new(0),
            oracle_unknown: AtomicU64::new(0),
            consistency_errors: AtomicU64::new(0),
            cycle_solves: AtomicU64::new(0),
            makespan: RwLock::new(Histogram::new_with_max(MAX_MAKESPAN_NS, 3).ok()),
            start_time: Instant::now(),
        }
    }

    /// Count one dispatch and its copies.
    pub fn record_dispatch(&self, plan: &TransferPlan, need_merge: bool) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
        if need_merge {
            self.merge_dispatches.fetch_add(1, Ordering::Relaxed);
        }
        self.record_transfers(plan);
    }

    /// Copies planned outside a dispatch, e.g. for a host read.
    pub fn record_transfers(&self, plan: &TransferPlan) {
        self.d2h_transfers
            .fetch_add(plan.d2h.len() as u64, Ordering::Relaxed);
        self.h2d_transfers
            .fetch_add(plan.h2d.len() as u64, Ordering::Relaxed);
        self.d2h_bytes.fetch_add(plan.d2h_bytes(), Ordering::Relaxed);
        self.h2d_bytes.fetch_add(plan.h2d_bytes(), Ordering::Relaxed);
        self.staged_bytes
            .fetch_add(plan.staged_bytes(), Ordering::Relaxed);
    }

    /// Count a recovered fault.
    pub fn record_fault(&self, fault: &Fault) {
        let counter = match fault {
            Fault::LegalizationFailure { .. } => &self.legalization_failures,
            Fault::NumericDegenerate(_) => &self.numeric_degenerate,
            Fault::OracleUnknown => &self.oracle_unknown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a dispatch aborted by a consistency error.
    pub fn record_consistency_error(&self) {
        self.consistency_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one LP solve.
    pub fn record_cycle_solve(&self) {
        self.cycle_solves.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one iteration's makespan in seconds.
    pub fn record_makespan(&self, secs: f64) {
        if !secs.is_finite() || secs < 0.0 {
            return;
        }
        let ns = Duration::from_secs_f64(secs).as_nanos().min(MAX_MAKESPAN_NS as u128) as u64;
        if let Some(hist) = self.makespan.write().as_mut() {
            let _ = hist.record(ns);
        }
    }

    /// Copy of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.makespan.read();
        let quantile = |q: f64| guard.as_ref().map_or(0, |h| h.value_at_quantile(q));
        let (samples, avg, max) = match guard.as_ref() {
            Some(h) if h.len() > 0 => (h.len(), h.mean() as u64, h.max()),
            _ => (0, 0, 0),
        };

        MetricsSnapshot {
            uptime: self.start_time.elapsed(),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            merge_dispatches: self.merge_dispatches.load(Ordering::Relaxed),
            d2h_transfers: self.d2h_transfers.load(Ordering::Relaxed),
            h2d_transfers: self.h2d_transfers.load(Ordering::Relaxed),
            d2h_bytes: self.d2h_bytes.load(Ordering::Relaxed),
            h2d_bytes: self.h2d_bytes.load(Ordering::Relaxed),
            staged_bytes: self.staged_bytes.load(Ordering::Relaxed),
            legalization_failures: self.legalization_failures.load(Ordering::Relaxed),
            numeric_degenerate: self.numeric_degenerate.load(Ordering::Relaxed),
            oracle_unknown: self.oracle_unknown.load(Ordering::Relaxed),
            consistency_errors: self.consistency_errors.load(Ordering::Relaxed),
            cycle_solves: self.cycle_solves.load(Ordering::Relaxed),
            makespan_samples: samples,
            avg_makespan_ns: avg,
            p50_makespan_ns: quantile(0.50),
            p95_makespan_ns: quantile(0.95),
            max_makespan_ns: max,
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in [
            &self.dispatches,
            &self.merge_dispatches,
            &self.d2h_transfers,
            &self.h2d_transfers,
            &self.d2h_bytes,
            &self.h2d_bytes,
            &self.staged_bytes,
            &self.legalization_failures,
            &self.numeric_degenerate,
            &self.oracle_unknown,
            &self.consistency_errors,
            &self.cycle_solves,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        if let Some(hist) = self.makespan.write().as_mut() {
            hist.reset();
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub uptime: Duration,
    pub dispatches: u64,
    pub merge_dispatches: u64,
    pub d2h_transfers: u64,
    pub h2d_transfers: u64,
    pub d2h_bytes: u64,
    pub h2d_bytes: u64,
    pub staged_bytes: u64,
    pub legalization_failures: u64,
    pub numeric_degenerate: u64,
    pub oracle_unknown: u64,
    pub consistency_errors: u64,
    pub cycle_solves: u64,
    pub makespan_samples: u64,
    pub avg_makespan_ns: u64,
    pub p50_makespan_ns: u64,
    pub p95_makespan_ns: u64,
    pub max_makespan_ns: u64,
}

impl MetricsSnapshot {
    /// Bytes moved in either direction.
    pub fn total_bytes(&self) -> u64 {
        self.d2h_bytes + self.h2d_bytes
    }

    /// Mean bytes moved per dispatch.
    pub fn bytes_per_dispatch(&self) -> f64 {
        if self.dispatches == 0 {
            return 0.0;
        }
        self.total_bytes() as f64 / self.dispatches as f64
    }
}
