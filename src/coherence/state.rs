//! Per-buffer valid-region bookkeeping.

use crate::device::DeviceId;
use crate::region::RegionSet;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a copy of buffer bytes lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Location {
    Host,
    Device(DeviceId),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Host => f.write_str("host"),
            Location::Device(d) => write!(f, "{}", d),
        }
    }
}

/// Which bytes of one buffer are valid at the host and at each device.
///
/// A byte may be valid at several locations at once. A write at one location
/// invalidates the byte everywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoherenceState {
    host: RegionSet,
    devices: Vec<RegionSet>,
}

impl CoherenceState {
    /// Fresh state: the host holds the whole extent, no device holds anything.
    pub fn new(num_devices: usize, extent: u64) -> Self {
        Self {
            host: RegionSet::whole(extent),
            devices: vec![RegionSet::new(); num_devices],
        }
    }

    /// Number of devices tracked.
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    /// Bytes valid in host memory.
    pub fn host(&self) -> &RegionSet {
        &self.host
    }

    /// Bytes valid on `id`.
    pub fn device(&self, id: DeviceId) -> &RegionSet {
        &self.devices[id.0]
    }

    /// Bytes valid at `loc`.
    pub fn valid_at(&self, loc: Location) -> &RegionSet {
        match loc {
            Location::Host => &self.host,
            Location::Device(d) => &self.devices[d.0],
        }
    }

    fn valid_at_mut(&mut self, loc: Location) -> &mut RegionSet {
        match loc {
            Location::Host => &mut self.host,
            Location::Device(d) => &mut self.devices[d.0],
        }
    }

    /// Record that `region` was copied to `loc`.
    pub fn validate(&mut self, loc: Location, region: &RegionSet) {
        self.valid_at_mut(loc).union_with(region);
    }

    /// Record a write of `region` at `loc`: valid there, nowhere else.
    pub fn mark_written(&mut self, loc: Location, region: &RegionSet) {
        if region.is_empty() {
            return;
        }
        if loc != Location::Host {
            self.host.difference_set(region);
        }
        for (i, valid) in self.devices.iter_mut().enumerate() {
            if loc != Location::Device(DeviceId(i)) {
                valid.difference_set(region);
            }
        }
        self.valid_at_mut(loc).union_with(region);
    }

    /// Union of every location's valid set.
    pub fn valid_anywhere(&self) -> RegionSet {
        self.devices
            .iter()
            .fold(self.host.clone(), |acc, valid| acc.union(valid))
    }

    /// Locations holding every byte of `region`.
    pub fn holders(&self, region: &RegionSet) -> Vec<Location> {
        std::iter::once(Location::Host)
            .chain((0..self.devices.len()).map(|i| Location::Device(DeviceId(i))))
            .filter(|loc| self.valid_at(*loc).covers(region))
            .collect()
    }
}
