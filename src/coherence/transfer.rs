//! Transfer descriptors handed to the driver.

use super::BufferId;
use crate::device::DeviceId;
use crate::region::Interval;
use serde::{Deserialize, Serialize};

/// Copy direction relative to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    DeviceToHost,
    HostToDevice,
}

/// One contiguous copy between the host and a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub buffer: BufferId,
    pub device: DeviceId,
    pub direction: Direction,
    pub interval: Interval,
    /// Lands in the pinned staging copy on its way to another device.
    pub staged: bool,
}

impl Transfer {
    /// Length of the copy in bytes.
    pub fn bytes(&self) -> u64 {
        self.interval.len()
    }
}

/// Copies required before a dispatch. All device-to-host copies must
/// complete before any host-to-device copy starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPlan {
    pub d2h: Vec<Transfer>,
    pub h2d: Vec<Transfer>,
}

impl TransferPlan {
    /// Plan with no copies.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing needs to be copied.
    pub fn is_empty(&self) -> bool {
        self.d2h.is_empty() && self.h2d.is_empty()
    }

    /// Total bytes copied device to host.
    pub fn d2h_bytes(&self) -> u64 {
        self.d2h.iter().map(Transfer::bytes).sum()
    }

    /// Total bytes copied host to device.
    pub fn h2d_bytes(&self) -> u64 {
        self.h2d.iter().map(Transfer::bytes).sum()
    }

    /// Device-to-host bytes that land in a staging copy.
    pub fn staged_bytes(&self) -> u64 {
        self.d2h.iter().filter(|t| t.staged).map(Transfer::bytes).sum()
    }

    /// Append the copies of `other`.
    pub fn extend(&mut self, other: TransferPlan) {
        self.d2h.extend(other.d2h);
        self.h2d.extend(other.h2d);
    }
}
