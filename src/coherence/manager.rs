//! Transfer planning under the Simple and Optim policies.

use super::state::{CoherenceState, Location};
use super::transfer::{Direction, Transfer, TransferPlan};
use super::BufferId;
use crate::config::BufferPolicy;
use crate::device::DeviceId;
use crate::error::{Error, Result};
use crate::region::RegionSet;
use std::collections::HashMap;
use tracing::debug;

/// Size information for a registered buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub id: BufferId,
    pub size: u64,
    /// Bytes actually in use; undefined regions resolve to this extent.
    pub max_used_size: Option<u64>,
}

impl BufferInfo {
    /// Bytes the coherence state covers: the max used size, else the full size.
    pub fn extent(&self) -> u64 {
        self.max_used_size.unwrap_or(self.size)
    }
}

#[derive(Debug)]
struct Entry {
    info: BufferInfo,
    state: CoherenceState,
    /// Size of the pinned host staging copy, allocated on first
    /// device-to-device route.
    staging: Option<u64>,
}

/// One buffer's share of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferRequest {
    pub buffer: BufferId,
    /// Per device: bytes that must be valid before the sub-kernel runs.
    pub required: Vec<RegionSet>,
    /// Per device: bytes the sub-kernel writes in place.
    pub written: Vec<RegionSet>,
    /// Bytes produced by a merge pass; valid on the host only afterwards.
    pub merged: RegionSet,
}

/// Owns the coherence state of every registered buffer.
#[derive(Debug)]
pub struct BufferManager {
    policy: BufferPolicy,
    num_devices: usize,
    buffers: HashMap<BufferId, Entry>,
}

impl BufferManager {
    /// Empty manager for `num_devices` devices.
    pub fn new(policy: BufferPolicy, num_devices: usize) -> Self {
        Self {
            policy,
            num_devices,
            buffers: HashMap::new(),
        }
    }

    /// Policy used to plan transfers.
    pub fn policy(&self) -> BufferPolicy {
        self.policy
    }

    /// Number of devices every buffer is tracked on.
    pub fn num_devices(&self) -> usize {
        self.num_devices
    }

    /// Register a buffer. Its contents start out valid on the host only.
    pub fn register_buffer(&mut self, id: BufferId, size: u64) -> Result<()> {
        if self.buffers.contains_key(&id) {
            return Err(Error::DuplicateBuffer(id));
        }
        self.buffers.insert(
            id,
            Entry {
                info: BufferInfo {
                    id,
                    size,
                    max_used_size: None,
                },
                state: CoherenceState::new(self.num_devices, size),
                staging: None,
            },
        );
        debug!(buffer = id.0, size, "registered buffer");
        Ok(())
    }

    /// Forget a buffer and its valid regions.
    pub fn release_buffer(&mut self, id: BufferId) -> Result<()> {
        self.buffers
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::UnknownBuffer(id))
    }

    /// Shrink the tracked extent of a buffer; `None` restores the full size.
    pub fn set_max_used_size(&mut self, id: BufferId, max_used: Option<u64>) -> Result<()> {
        let entry = self.entry_mut(id)?;
        if let Some(m) = max_used {
            if m > entry.info.size {
                return Err(Error::MaxUsedSize {
                    buffer: id,
                    max_used: m,
                    size: entry.info.size,
                });
            }
        }
        entry.info.max_used_size = max_used;
        Ok(())
    }

    /// Size and extent of a registered buffer.
    pub fn info(&self, id: BufferId) -> Option<BufferInfo> {
        self.buffers.get(&id).map(|e| e.info)
    }

    /// Current valid regions of a registered buffer.
    pub fn state(&self, id: BufferId) -> Option<&CoherenceState> {
        self.buffers.get(&id).map(|e| &e.state)
    }

    /// Size of the staging copy held for `id`, if one was allocated.
    pub fn staging_size(&self, id: BufferId) -> Option<u64> {
        self.buffers.get(&id).and_then(|e| e.staging)
    }

    fn entry_mut(&mut self, id: BufferId) -> Result<&mut Entry> {
        self.buffers.get_mut(&id).ok_or(Error::UnknownBuffer(id))
    }

    /// Plan the copies that make `required[d]` valid on every device `d`,
    /// then record `written[d]` as valid on `d` only.
    ///
    /// Undefined regions stand for the buffer's whole used extent. On a
    /// [`Error::Consistency`] failure the state is left untouched.
    pub fn compute_transfers(
        &mut self,
        id: BufferId,
        required: &[RegionSet],
        written: &[RegionSet],
    ) -> Result<TransferPlan> {
        self.plan_dispatch(&[BufferRequest {
            buffer: id,
            required: required.to_vec(),
            written: written.to_vec(),
            merged: RegionSet::new(),
        }])
    }

    /// Plan every buffer touched by one dispatch. Either all states advance
    /// or, on any error, none do.
    pub fn plan_dispatch(&mut self, requests: &[BufferRequest]) -> Result<TransferPlan> {
        let n = self.num_devices;
        let mut staged: Vec<(BufferId, CoherenceState, bool)> = Vec::with_capacity(requests.len());
        let mut plan = TransferPlan::new();

        for req in requests {
            for list in [&req.required, &req.written] {
                if list.len() != n {
                    return Err(Error::DeviceCountMismatch {
                        expected: n,
                        got: list.len(),
                    });
                }
            }
            let entry = self
                .buffers
                .get(&req.buffer)
                .ok_or(Error::UnknownBuffer(req.buffer))?;
            let (state, part) = plan_entry(self.policy, entry, req)?;
            let uses_staging = part.staged_bytes() > 0;
            plan.extend(part);
            staged.push((req.buffer, state, uses_staging));
        }

        for (id, state, uses_staging) in staged {
            if let Some(entry) = self.buffers.get_mut(&id) {
                entry.state = state;
                if uses_staging && entry.staging.is_none() {
                    entry.staging = Some(entry.info.size);
                    debug!(buffer = id.0, size = entry.info.size, "allocated staging copy");
                }
            }
        }

        debug!(
            buffers = requests.len(),
            d2h = plan.d2h.len(),
            h2d = plan.h2d.len(),
            d2h_bytes = plan.d2h_bytes(),
            h2d_bytes = plan.h2d_bytes(),
            staged_bytes = plan.staged_bytes(),
            "planned transfers"
        );
        Ok(plan)
    }

    /// The application wrote `region` from the host.
    pub fn host_write(&mut self, id: BufferId, region: &RegionSet) -> Result<()> {
        let entry = self.entry_mut(id)?;
        let region = region.resolve(entry.info.extent());
        entry.state.mark_written(Location::Host, &region);
        Ok(())
    }

    /// Copies needed before the application may read `region` on the host.
    pub fn host_read(&mut self, id: BufferId, region: &RegionSet) -> Result<TransferPlan> {
        let entry = self.entry_mut(id)?;
        let region = region.resolve(entry.info.extent());
        let mut state = entry.state.clone();
        let mut plan = TransferPlan::new();

        let missing = region.minus(state.host());
        let residual = pull_to_host(id, &mut state, missing, None, false, &mut plan);
        if !residual.is_empty() {
            return Err(Error::Consistency {
                buffer: id,
                location: Location::Host,
                missing: residual,
            });
        }
        entry.state = state;
        Ok(plan)
    }

    /// After a merge pass the merged bytes are valid on the host only.
    pub fn merge_written(&mut self, id: BufferId, region: &RegionSet) -> Result<()> {
        let entry = self.entry_mut(id)?;
        let region = region.resolve(entry.info.extent());
        entry.state.mark_written(Location::Host, &region);
        Ok(())
    }
}

/// Plan one buffer against a copy of its state.
fn plan_entry(
    policy: BufferPolicy,
    entry: &Entry,
    req: &BufferRequest,
) -> Result<(CoherenceState, TransferPlan)> {
    let id = req.buffer;
    let extent = entry.info.extent();
    let required: Vec<RegionSet> = req.required.iter().map(|r| r.resolve(extent)).collect();

    let mut state = entry.state.clone();
    let plan = match policy {
        BufferPolicy::Simple => plan_simple(id, &mut state, &required, extent)?,
        BufferPolicy::Optim => plan_optim(id, &mut state, &required)?,
    };

    for (d, w) in req.written.iter().enumerate() {
        state.mark_written(Location::Device(DeviceId(d)), &w.resolve(extent));
    }
    if !req.merged.is_empty() {
        state.mark_written(Location::Host, &req.merged.resolve(extent));
    }
    Ok((state, plan))
}

/// Consume other devices' valid sets to fill `missing` on the host, emitting
/// one device-to-host copy per interval. Returns what could not be found.
fn pull_to_host(
    id: BufferId,
    state: &mut CoherenceState,
    mut missing: RegionSet,
    exclude: Option<DeviceId>,
    staged: bool,
    plan: &mut TransferPlan,
) -> RegionSet {
    for e in (0..state.num_devices()).map(DeviceId) {
        if missing.is_empty() {
            break;
        }
        if Some(e) == exclude {
            continue;
        }
        let part = RegionSet::intersection(&missing, state.device(e));
        if part.is_empty() {
            continue;
        }
        plan.d2h.extend(part.iter().map(|iv| Transfer {
            buffer: id,
            device: e,
            direction: Direction::DeviceToHost,
            interval: *iv,
            staged,
        }));
        state.validate(Location::Host, &part);
        missing.difference_set(&part);
    }
    missing
}

fn plan_optim(
    id: BufferId,
    state: &mut CoherenceState,
    required: &[RegionSet],
) -> Result<TransferPlan> {
    let mut plan = TransferPlan::new();

    for (d, req) in required.iter().enumerate() {
        let dev = DeviceId(d);
        if req.is_empty() {
            continue;
        }
        let missing_on_device = req.minus(state.device(dev));
        if missing_on_device.is_empty() {
            continue;
        }

        let missing_on_host = missing_on_device.minus(state.host());
        let residual = pull_to_host(id, state, missing_on_host, Some(dev), true, &mut plan);
        if !residual.is_empty() {
            return Err(Error::Consistency {
                buffer: id,
                location: Location::Device(dev),
                missing: residual,
            });
        }

        plan.h2d.extend(missing_on_device.iter().map(|iv| Transfer {
            buffer: id,
            device: dev,
            direction: Direction::HostToDevice,
            interval: *iv,
            staged: false,
        }));
        state.validate(Location::Device(dev), &missing_on_device);
    }

    Ok(plan)
}

fn plan_simple(
    id: BufferId,
    state: &mut CoherenceState,
    required: &[RegionSet],
    extent: u64,
) -> Result<TransferPlan> {
    let mut plan = TransferPlan::new();
    let whole = RegionSet::whole(extent);

    // Any device holding bytes the host lacks sends back everything it holds.
    for e in (0..state.num_devices()).map(DeviceId) {
        if state.device(e).minus(state.host()).is_empty() {
            continue;
        }
        let held = state.device(e).clone();
        plan.d2h.extend(held.iter().map(|iv| Transfer {
            buffer: id,
            device: e,
            direction: Direction::DeviceToHost,
            interval: *iv,
            staged: false,
        }));
        state.validate(Location::Host, &held);
    }

    for (d, req) in required.iter().enumerate() {
        if req.is_empty() {
            continue;
        }
        let dev = DeviceId(d);
        let missing = whole.minus(state.host());
        if !missing.is_empty() {
            return Err(Error::Consistency {
                buffer: id,
                location: Location::Device(dev),
                missing,
            });
        }
        plan.h2d.extend(whole.iter().map(|iv| Transfer {
            buffer: id,
            device: dev,
            direction: Direction::HostToDevice,
            interval: *iv,
            staged: false,
        }));
        state.validate(Location::Device(dev), &whole);
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Interval;

    fn r(lb: u64, hb: u64) -> RegionSet {
        RegionSet::from(Interval::new(lb, hb))
    }

    fn none() -> RegionSet {
        RegionSet::new()
    }

    #[test]
    fn test_first_dispatch_uploads_required() {
        let mut mgr = BufferManager::new(BufferPolicy::Optim, 2);
        mgr.register_buffer(BufferId(1), 100).unwrap();

        let plan = mgr
            .compute_transfers(BufferId(1), &[r(0, 49), r(50, 99)], &[none(), none()])
            .unwrap();
        assert!(plan.d2h.is_empty());
        assert_eq!(plan.h2d.len(), 2);
        assert_eq!(plan.h2d_bytes(), 100);
    }

    #[test]
    fn test_device_to_device_goes_through_staging() {
        let mut mgr = BufferManager::new(BufferPolicy::Optim, 2);
        let id = BufferId(1);
        mgr.register_buffer(id, 100).unwrap();
        mgr.compute_transfers(id, &[r(0, 99), none()], &[r(0, 99), none()])
            .unwrap();

        let plan = mgr
            .compute_transfers(id, &[none(), r(20, 39)], &[none(), none()])
            .unwrap();
        assert_eq!(plan.d2h.len(), 1);
        assert_eq!(plan.d2h[0].device, DeviceId(0));
        assert_eq!(plan.d2h[0].interval, Interval::new(20, 39));
        assert!(plan.d2h[0].staged);
        assert_eq!(plan.h2d[0].device, DeviceId(1));
        assert_eq!(mgr.staging_size(id), Some(100));
    }

    #[test]
    fn test_consistency_error_leaves_state() {
        let mut mgr = BufferManager::new(BufferPolicy::Optim, 2);
        let id = BufferId(9);
        mgr.register_buffer(id, 64).unwrap();

        // Nobody holds [46,63] any more.
        let mut state = CoherenceState::new(2, 0);
        state.validate(Location::Host, &r(0, 39));
        state.validate(Location::Device(DeviceId(0)), &r(0, 45));
        mgr.buffers.get_mut(&id).unwrap().state = state.clone();

        let err = mgr
            .compute_transfers(id, &[none(), r(30, 50)], &[none(), none()])
            .unwrap_err();
        assert!(err.is_fatal());
        match err {
            Error::Consistency { missing, location, .. } => {
                assert_eq!(location, Location::Device(DeviceId(1)));
                assert_eq!(missing, r(46, 50));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(mgr.state(id).unwrap(), &state);
        assert_eq!(mgr.staging_size(id), None);
    }

    #[test]
    fn test_simple_restages_whole_buffer() {
        let mut mgr = BufferManager::new(BufferPolicy::Simple, 2);
        let id = BufferId(2);
        mgr.register_buffer(id, 40).unwrap();

        let plan = mgr
            .compute_transfers(id, &[r(0, 9), r(10, 19)], &[r(0, 9), none()])
            .unwrap();
        assert_eq!(plan.h2d.len(), 2);
        assert!(plan.h2d.iter().all(|t| t.interval == Interval::new(0, 39)));

        // Device 0 wrote, so it sends its whole copy back next time.
        let plan = mgr
            .compute_transfers(id, &[r(0, 9), r(10, 19)], &[none(), none()])
            .unwrap();
        assert_eq!(plan.d2h.len(), 1);
        assert_eq!(plan.d2h[0].interval, Interval::new(0, 39));
        assert_eq!(plan.h2d_bytes(), 80);
    }

    #[test]
    fn test_host_read_and_write() {
        let mut mgr = BufferManager::new(BufferPolicy::Optim, 1);
        let id = BufferId(3);
        mgr.register_buffer(id, 16).unwrap();
        mgr.compute_transfers(id, &[r(0, 15)], &[r(4, 7)]).unwrap();

        let plan = mgr.host_read(id, &RegionSet::undefined()).unwrap();
        assert_eq!(plan.d2h.len(), 1);
        assert_eq!(plan.d2h[0].interval, Interval::new(4, 7));
        assert!(!plan.d2h[0].staged);
        assert!(mgr.host_read(id, &RegionSet::undefined()).unwrap().is_empty());

        mgr.host_write(id, &r(0, 3)).unwrap();
        let state = mgr.state(id).unwrap();
        assert_eq!(state.device(DeviceId(0)), &r(4, 15));
    }

    #[test]
    fn test_dispatch_is_all_or_nothing() {
        let mut mgr = BufferManager::new(BufferPolicy::Optim, 2);
        mgr.register_buffer(BufferId(1), 32).unwrap();
        mgr.register_buffer(BufferId(2), 32).unwrap();
        let before = mgr.state(BufferId(1)).unwrap().clone();

        let requests = [
            BufferRequest {
                buffer: BufferId(1),
                required: vec![r(0, 15), r(16, 31)],
                written: vec![r(0, 15), r(16, 31)],
                merged: none(),
            },
            BufferRequest {
                buffer: BufferId(5),
                required: vec![none(), none()],
                written: vec![none(), none()],
                merged: none(),
            },
        ];
        assert!(matches!(
            mgr.plan_dispatch(&requests),
            Err(Error::UnknownBuffer(BufferId(5)))
        ));
        assert_eq!(mgr.state(BufferId(1)).unwrap(), &before);
    }

    #[test]
    fn test_merged_bytes_live_on_host() {
        let mut mgr = BufferManager::new(BufferPolicy::Optim, 2);
        let id = BufferId(4);
        mgr.register_buffer(id, 32).unwrap();

        let plan = mgr
            .plan_dispatch(&[BufferRequest {
                buffer: id,
                required: vec![r(0, 31), r(0, 31)],
                written: vec![none(), none()],
                merged: r(8, 23),
            }])
            .unwrap();
        assert_eq!(plan.h2d_bytes(), 64);

        let state = mgr.state(id).unwrap();
        assert_eq!(state.host(), &r(0, 31));
        let mut expect = r(0, 7);
        expect.add(Interval::new(24, 31));
        assert_eq!(state.device(DeviceId(0)), &expect);
        assert_eq!(state.device(DeviceId(1)), &expect);
    }

    #[test]
    fn test_registration_errors() {
        let mut mgr = BufferManager::new(BufferPolicy::Optim, 1);
        mgr.register_buffer(BufferId(1), 8).unwrap();
        assert!(matches!(
            mgr.register_buffer(BufferId(1), 8),
            Err(Error::DuplicateBuffer(_))
        ));
        assert!(matches!(
            mgr.set_max_used_size(BufferId(1), Some(9)),
            Err(Error::MaxUsedSize { .. })
        ));
        assert!(matches!(
            mgr.compute_transfers(BufferId(1), &[], &[]),
            Err(Error::DeviceCountMismatch { expected: 1, got: 0 })
        ));
        mgr.release_buffer(BufferId(1)).unwrap();
        assert!(mgr.release_buffer(BufferId(1)).is_err());
    }
}
