//! Error types.

use crate::coherence::{BufferId, Location};
use crate::region::RegionSet;
use crate::scheduler::KernelId;

/// Result type for partita operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the caller. Every variant aborts the operation that
/// produced it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{buffer}: region {missing} required at {location} has no valid copy anywhere")]
    Consistency {
        buffer: BufferId,
        location: Location,
        missing: RegionSet,
    },

    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid partition: {0}")]
    InvalidPartition(String),

    #[error("unknown kernel {0}")]
    UnknownKernel(KernelId),

    #[error("{0} has no dispatch awaiting timers")]
    NoPendingDispatch(KernelId),

    #[error("unknown buffer {0}")]
    UnknownBuffer(BufferId),

    #[error("buffer {0} is already registered")]
    DuplicateBuffer(BufferId),

    #[error("buffer {buffer}: max used size {max_used} exceeds size {size}")]
    MaxUsedSize {
        buffer: BufferId,
        max_used: u64,
        size: u64,
    },

    #[error("expected {expected} per-device entries, got {got}")]
    DeviceCountMismatch { expected: usize, got: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Resource exhaustion error.
    pub fn resource_exhaustion<S: Into<String>>(msg: S) -> Self {
        Error::ResourceExhaustion(msg.into())
    }

    /// Invalid partition error.
    pub fn invalid_partition<S: Into<String>>(msg: S) -> Self {
        Error::InvalidPartition(msg.into())
    }

    /// Serialization error.
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        Error::Serialization(msg.into())
    }

    /// Errors that must abort the current dispatch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Consistency { .. } | Error::ResourceExhaustion(_))
    }
}

/// Faults the scheduler recovers from locally. They are logged and counted
/// but never returned to the caller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Fault {
    #[error("granularity {granularity:?} yields overlapping writes along dimension {dim}")]
    LegalizationFailure { dim: usize, granularity: Vec<f64> },

    #[error("argument bounds unknown, treating as whole buffer")]
    OracleUnknown,

    #[error("numeric degenerate update: {0}")]
    NumericDegenerate(String),
}
