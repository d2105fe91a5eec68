//! Metrics export.

use super::metrics::MetricsSnapshot;
use crate::error::{Error, Result};
use serde::Serialize;
use std::path::PathBuf;

/// Trait for exporting metrics to different formats
pub trait MetricsExporter: Send + Sync {
    fn export(&self, snapshot: &MetricsSnapshot) -> Result<()>;
}

/// Writes each snapshot to a JSON file, replacing the previous one.
#[derive(Debug, Clone)]
pub struct JsonExporter {
    output_path: PathBuf,
}

impl JsonExporter {
    /// Exporter writing to `output_path`.
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
        }
    }
}

impl MetricsExporter for JsonExporter {
    fn export(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        let serializable = SerializableSnapshot::from(snapshot);
        let json = serde_json::to_string_pretty(&serializable)
            .map_err(|e| Error::serialization(format!("JSON serialization failed: {}", e)))?;
        std::fs::write(&self.output_path, json)?;
        Ok(())
    }
}

/// Serializable version of MetricsSnapshot
#[derive(Debug, Clone, Serialize)]
struct SerializableSnapshot {
    uptime_secs: f64,
    dispatches: u64,
    merge_dispatches: u64,
    d2h_transfers: u64,
    h2d_transfers: u64,
    d2h_mb: f64,
    h2d_mb: f64,
    staged_mb: f64,
    bytes_per_dispatch: f64,
    legalization_failures: u64,
    numeric_degenerate: u64,
    oracle_unknown: u64,
    consistency_errors: u64,
    cycle_solves: u64,
    makespan_samples: u64,
    avg_makespan_us: f64,
    p50_makespan_us: f64,
    p95_makespan_us: f64,
    max_makespan_us: f64,
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

impl From<&MetricsSnapshot> for SerializableSnapshot {
    fn from(s: &MetricsSnapshot) -> Self {
        Self {
            uptime_secs: s.uptime.as_secs_f64(),
            dispatches: s.dispatches,
            merge_dispatches: s.merge_dispatches,
            d2h_transfers: s.d2h_transfers,
            h2d_transfers: s.h2d_transfers,
            d2h_mb: mb(s.d2h_bytes),
            h2d_mb: mb(s.h2d_bytes),
            staged_mb: mb(s.staged_bytes),
            bytes_per_dispatch: s.bytes_per_dispatch(),
            legalization_failures: s.legalization_failures,
            numeric_degenerate: s.numeric_degenerate,
            oracle_unknown: s.oracle_unknown,
            consistency_errors: s.consistency_errors,
            cycle_solves: s.cycle_solves,
            makespan_samples: s.makespan_samples,
            avg_makespan_us: s.avg_makespan_ns as f64 / 1_000.0,
            p50_makespan_us: s.p50_makespan_ns as f64 / 1_000.0,
            p95_makespan_us: s.p95_makespan_ns as f64 / 1_000.0,
            max_makespan_us: s.max_makespan_ns as f64 / 1_000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_exporter() {
        let path = std::env::temp_dir().join("partita_metrics_test.json");
        let exporter = JsonExporter::new(&path);
        let snapshot = MetricsSnapshot {
            dispatches: 4,
            h2d_bytes: 2 * 1024 * 1024,
            ..MetricsSnapshot::default()
        };

        assert!(exporter.export(&snapshot).is_ok());
        let json = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["dispatches"], 4);
        assert_eq!(value["h2d_mb"], 2.0);

        let _ = std::fs::remove_file(&path);
    }
}
