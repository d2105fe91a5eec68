//! Multi-device buffer coherence.
//!
//! Every shared buffer tracks which bytes are valid on the host and on each
//! device. Before a dispatch the [`BufferManager`] turns the per-device
//! required regions into the smallest set of copies that makes them valid,
//! then records the dispatch's writes.

pub mod manager;
pub mod state;
pub mod transfer;

pub use manager::{BufferInfo, BufferManager, BufferRequest};
pub use state::{CoherenceState, Location};
pub use transfer::{Direction, Transfer, TransferPlan};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Caller-assigned buffer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer {}", self.0)
    }
}
