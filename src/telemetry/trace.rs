//! Per-dispatch schedule trace.
//!
//! A [`ScheduleTrace`] records what the scheduler decided and observed, in
//! order, so a run can be inspected or replayed offline.

use crate::error::{Error, Result};
use crate::scheduler::{Granularity, KernelId, ScheduleMode};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One scheduling event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    Dispatch {
        kernel: KernelId,
        iteration: u64,
        mode: ScheduleMode,
        granularity: Granularity,
        h2d_bytes: u64,
        d2h_bytes: u64,
    },
    Timing {
        kernel: KernelId,
        iteration: u64,
        device_times: Vec<f64>,
        makespan: f64,
    },
    ModeChange {
        kernel: KernelId,
        from: ScheduleMode,
        to: ScheduleMode,
    },
    Converged {
        kernel: KernelId,
        iteration: u64,
        granularity: Granularity,
    },
    Frozen {
        kernel: KernelId,
        granularity: Granularity,
    },
    CycleSolved {
        objective: f64,
        granularities: Vec<Granularity>,
    },
}

impl TraceEvent {
    /// Kernel the event belongs to, if any.
    pub fn kernel(&self) -> Option<KernelId> {
        match self {
            TraceEvent::Dispatch { kernel, .. }
            | TraceEvent::Timing { kernel, .. }
            | TraceEvent::ModeChange { kernel, .. }
            | TraceEvent::Converged { kernel, .. }
            | TraceEvent::Frozen { kernel, .. } => Some(*kernel),
            TraceEvent::CycleSolved { .. } => None,
        }
    }
}

/// Ordered record of scheduling events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleTrace {
    events: Vec<TraceEvent>,
}

impl ScheduleTrace {
    /// Empty trace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event.
    pub fn push(&mut self, event: TraceEvent) {
        self.events.push(event);
    }

    /// Events in the order they happened.
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events of one kernel.
    pub fn for_kernel(&self, kernel: KernelId) -> impl Iterator<Item = &TraceEvent> {
        self.events
            .iter()
            .filter(move |e| e.kernel() == Some(kernel))
    }

    /// Granularities dispatched for `kernel`, in order.
    pub fn granularities(&self, kernel: KernelId) -> Vec<Granularity> {
        self.for_kernel(kernel)
            .filter_map(|e| match e {
                TraceEvent::Dispatch { granularity, .. } => Some(granularity.clone()),
                _ => None,
            })
            .collect()
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Parse a trace written by [`ScheduleTrace::to_json`].
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Write the trace as JSON to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Read a trace saved with [`ScheduleTrace::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
