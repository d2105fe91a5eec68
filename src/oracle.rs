//! Argument region analysis.
//!
//! The oracle tells the scheduler which bytes of each buffer argument a kernel
//! reads and writes, for the full index space and for each sub-partition.
//! Real deployments plug in a static analyzer; [`AffineOracle`] covers kernels
//! whose accesses are affine in the work-item id.

use crate::coherence::BufferId;
use crate::partition::{WorkPartition, MAX_DIMS};
use crate::region::{Interval, RegionSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A kernel argument value as seen by the interception layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelArg {
    Scalar(i64),
    Buffer(BufferId),
}

/// Reasons an oracle cannot describe a kernel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    #[error("bounds of argument {arg} cannot be determined statically")]
    BoundsUnknown { arg: usize },

    #[error("argument {arg} is not a {expected}")]
    ArgumentKind { arg: usize, expected: &'static str },
}

/// Bytes read and written through one argument.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRegions {
    pub read: RegionSet,
    pub write: RegionSet,
}

impl AccessRegions {
    /// Both directions cover the whole buffer.
    pub fn undefined() -> Self {
        Self {
            read: RegionSet::undefined(),
            write: RegionSet::undefined(),
        }
    }

    /// Whole-buffer regions for an argument whose bounds are unknown. Only
    /// the directions `mode` accesses are marked.
    pub fn unbounded(mode: AccessMode) -> Self {
        Self {
            read: if mode.reads() { RegionSet::undefined() } else { RegionSet::new() },
            write: if mode.writes() { RegionSet::undefined() } else { RegionSet::new() },
        }
    }

    /// Everything the device must hold before running: reads and writes.
    /// Writes are included so partial writes never expose stale neighbours.
    pub fn required(&self) -> RegionSet {
        self.read.union(&self.write)
    }

    fn union_with(&mut self, other: &AccessRegions) {
        self.read.union_with(&other.read);
        self.write.union_with(&other.write);
    }
}

/// Regions of one buffer argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentRegions {
    pub arg_index: usize,
    pub buffer: BufferId,
    pub full: AccessRegions,
    pub per_sub: Vec<AccessRegions>,
}

/// Regions of every buffer argument for one split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub arguments: Vec<ArgumentRegions>,
    /// Written sub-regions are pairwise disjoint (or nothing is written).
    pub can_split: bool,
}

impl AnalysisResult {
    /// Result over `arguments`; splitting is allowed when writes are disjoint.
    pub fn new(arguments: Vec<ArgumentRegions>) -> Self {
        let mut result = Self {
            arguments,
            can_split: false,
        };
        result.can_split = result.writes_disjoint();
        result
    }

    /// Result used when the oracle gives up: every buffer argument is read
    /// and written in full, and splitting is not allowed. Empty
    /// sub-partitions touch nothing.
    pub fn unknown(args: &[KernelArg], subs: &[WorkPartition]) -> Self {
        let arguments = args
            .iter()
            .enumerate()
            .filter_map(|(i, arg)| match arg {
                KernelArg::Buffer(buffer) => Some(ArgumentRegions {
                    arg_index: i,
                    buffer: *buffer,
                    full: AccessRegions::undefined(),
                    per_sub: subs
                        .iter()
                        .map(|sub| {
                            if sub.is_empty() {
                                AccessRegions::default()
                            } else {
                                AccessRegions::undefined()
                            }
                        })
                        .collect(),
                }),
                KernelArg::Scalar(_) => None,
            })
            .collect();
        Self {
            arguments,
            can_split: false,
        }
    }

    /// Per-buffer regions for each sub-partition, with aliasing arguments
    /// folded together.
    pub fn per_buffer(&self) -> BTreeMap<BufferId, Vec<AccessRegions>> {
        let mut out: BTreeMap<BufferId, Vec<AccessRegions>> = BTreeMap::new();
        for arg in &self.arguments {
            let entry = out
                .entry(arg.buffer)
                .or_insert_with(|| vec![AccessRegions::default(); arg.per_sub.len()]);
            for (acc, sub) in entry.iter_mut().zip(&arg.per_sub) {
                acc.union_with(sub);
            }
        }
        out
    }

    /// True when no two sub-partitions write the same byte of any buffer.
    pub fn writes_disjoint(&self) -> bool {
        self.per_buffer().values().all(|subs| {
            pairwise(subs.len())
                .all(|(i, j)| !subs[i].write.overlaps(&subs[j].write))
        })
    }

    /// True when no sub-partition writes bytes another sub-partition reads,
    /// which is what a diff-based merge pass needs. Unbounded writes cannot
    /// be merged.
    pub fn merge_legal(&self) -> bool {
        self.per_buffer().values().all(|subs| {
            subs.iter().all(|s| !s.write.is_undefined())
                && pairwise(subs.len()).all(|(i, j)| {
                !subs[i].write.overlaps(&subs[j].read) && !subs[j].write.overlaps(&subs[i].read)
            })
        })
    }
}

fn pairwise(n: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..n).flat_map(move |i| (i + 1..n).map(move |j| (i, j)))
}

/// Source of read/write regions for a kernel's buffer arguments.
pub trait ArgumentRegionOracle {
    fn analyze(
        &self,
        args: &[KernelArg],
        full: &WorkPartition,
        subs: &[WorkPartition],
    ) -> Result<AnalysisResult, OracleError>;

    /// Regions to use once `analyze` has failed. The default knows nothing
    /// about access modes, so every buffer argument is read and written in
    /// full.
    fn fallback(
        &self,
        args: &[KernelArg],
        _full: &WorkPartition,
        subs: &[WorkPartition],
    ) -> AnalysisResult {
        AnalysisResult::unknown(args, subs)
    }
}

/// How a kernel touches a buffer argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    fn reads(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    fn writes(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }
}

/// Element index touched by work item `i` is
/// `base + offset_arg + sum(strides[d] * i[d])`, widened by `halo` elements
/// on reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessPattern {
    Affine {
        elem_size: u64,
        base: u64,
        /// Scalar argument whose value is added to `base`.
        offset_arg: Option<usize>,
        strides: [u64; MAX_DIMS],
        halo: u64,
    },
    Unknown,
}

impl AccessPattern {
    /// Row-major layout over a `width x height` grid of `elem_size` elements.
    pub fn row_major(elem_size: u64, width: u64, height: u64) -> Self {
        AccessPattern::Affine {
            elem_size,
            base: 0,
            offset_arg: None,
            strides: [1, width, width * height],
            halo: 0,
        }
    }

    /// Widen reads by `elems` elements on each side.
    pub fn with_halo(mut self, elems: u64) -> Self {
        if let AccessPattern::Affine { halo, .. } = &mut self {
            *halo = elems;
        }
        self
    }

    /// Add the value of scalar argument `arg` to the base element.
    pub fn with_offset_arg(mut self, arg: usize) -> Self {
        if let AccessPattern::Affine { offset_arg, .. } = &mut self {
            *offset_arg = Some(arg);
        }
        self
    }
}

/// Declared access of one kernel argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentAccess {
    pub arg_index: usize,
    pub mode: AccessMode,
    pub pattern: AccessPattern,
}

/// Oracle for kernels whose buffer accesses are affine in the work-item id.
#[derive(Debug, Clone, Default)]
pub struct AffineOracle {
    accesses: Vec<ArgumentAccess>,
}

impl AffineOracle {
    /// Oracle with no declared accesses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare how argument `arg_index` is accessed.
    pub fn access(mut self, arg_index: usize, mode: AccessMode, pattern: AccessPattern) -> Self {
        self.accesses.push(ArgumentAccess {
            arg_index,
            mode,
            pattern,
        });
        self
    }

    fn regions(
        &self,
        access: &ArgumentAccess,
        args: &[KernelArg],
        part: &WorkPartition,
    ) -> Result<AccessRegions, OracleError> {
        let (elem_size, base, offset_arg, strides, halo) = match &access.pattern {
            AccessPattern::Affine {
                elem_size,
                base,
                offset_arg,
                strides,
                halo,
            } => (*elem_size, *base, *offset_arg, *strides, *halo),
            AccessPattern::Unknown => {
                return Err(OracleError::BoundsUnknown {
                    arg: access.arg_index,
                })
            }
        };

        let shift = match offset_arg {
            Some(i) => match args.get(i) {
                Some(KernelArg::Scalar(v)) => *v as i128,
                _ => {
                    return Err(OracleError::ArgumentKind {
                        arg: i,
                        expected: "scalar",
                    })
                }
            },
            None => 0,
        };

        let mut out = AccessRegions::default();
        if part.is_empty() {
            return Ok(out);
        }

        let read = affine_region(part, elem_size, base as i128 + shift, &strides, halo);
        if access.mode.reads() {
            out.read = read;
        }
        if access.mode.writes() {
            out.write = affine_region(part, elem_size, base as i128 + shift, &strides, 0);
        }
        Ok(out)
    }
}

/// Bytes covered by an affine access over a non-empty partition. Rows along
/// dim 0 become one interval each; overlapping rows merge on insertion.
fn affine_region(
    part: &WorkPartition,
    elem_size: u64,
    base: i128,
    strides: &[u64; MAX_DIMS],
    halo: u64,
) -> RegionSet {
    let dims = part.work_dim();
    let offset = part.offset();
    let size = part.global_size();

    let mut outer: Vec<i128> = vec![0];
    for d in 1..dims {
        let mut next = Vec::with_capacity(outer.len() * size[d] as usize);
        for start in &outer {
            for i in offset[d]..offset[d] + size[d] {
                next.push(start + strides[d] as i128 * i as i128);
            }
        }
        outer = next;
    }

    let row_lo = strides[0] as i128 * offset[0] as i128;
    let row_hi = strides[0] as i128 * (offset[0] + size[0] - 1) as i128;
    let es = elem_size.max(1) as i128;

    let mut set = RegionSet::new();
    for start in outer {
        let lo = (base + start + row_lo - halo as i128).max(0);
        let hi = base + start + row_hi + halo as i128;
        if hi < 0 {
            continue;
        }
        set.add(Interval::new((lo * es) as u64, ((hi + 1) * es - 1) as u64));
    }
    set
}

impl ArgumentRegionOracle for AffineOracle {
    fn analyze(
        &self,
        args: &[KernelArg],
        full: &WorkPartition,
        subs: &[WorkPartition],
    ) -> Result<AnalysisResult, OracleError> {
        let mut arguments = Vec::with_capacity(self.accesses.len());
        for access in &self.accesses {
            let buffer = match args.get(access.arg_index) {
                Some(KernelArg::Buffer(b)) => *b,
                _ => {
                    return Err(OracleError::ArgumentKind {
                        arg: access.arg_index,
                        expected: "buffer",
                    })
                }
            };
            let full_regions = self.regions(access, args, full)?;
            let per_sub = subs
                .iter()
                .map(|sub| self.regions(access, args, sub))
                .collect::<Result<Vec<_>, _>>()?;
            arguments.push(ArgumentRegions {
                arg_index: access.arg_index,
                buffer,
                full: full_regions,
                per_sub,
            });
        }
        Ok(AnalysisResult::new(arguments))
    }

    /// Only the arguments that cannot be bounded become whole-buffer, and
    /// only in the directions they are declared to access.
    fn fallback(
        &self,
        args: &[KernelArg],
        full: &WorkPartition,
        subs: &[WorkPartition],
    ) -> AnalysisResult {
        let mut arguments = Vec::with_capacity(self.accesses.len());
        for access in &self.accesses {
            let buffer = match args.get(access.arg_index) {
                Some(KernelArg::Buffer(b)) => *b,
                _ => return AnalysisResult::unknown(args, subs),
            };
            let bound = |part: &WorkPartition| {
                if part.is_empty() {
                    return AccessRegions::default();
                }
                self.regions(access, args, part)
                    .unwrap_or_else(|_| AccessRegions::unbounded(access.mode))
            };
            arguments.push(ArgumentRegions {
                arg_index: access.arg_index,
                buffer,
                full: bound(full),
                per_sub: subs.iter().map(bound).collect(),
            });
        }
        AnalysisResult::new(arguments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector_kernel() -> (AffineOracle, Vec<KernelArg>) {
        // out[i] = in[i-1] + in[i] + in[i+1]
        let oracle = AffineOracle::new()
            .access(0, AccessMode::Read, AccessPattern::row_major(4, 0, 0).with_halo(1))
            .access(1, AccessMode::Write, AccessPattern::row_major(4, 0, 0));
        let args = vec![KernelArg::Buffer(BufferId(1)), KernelArg::Buffer(BufferId(2))];
        (oracle, args)
    }

    #[test]
    fn test_affine_1d_regions() {
        let (oracle, args) = vector_kernel();
        let full = WorkPartition::new(&[100], &[10]).unwrap();
        let subs = full.split_dim(0, &[0.5, 0.5]).unwrap();
        let result = oracle.analyze(&args, &full, &subs).unwrap();

        assert!(result.can_split);
        let input = &result.arguments[0];
        assert_eq!(input.per_sub[0].read, RegionSet::from(Interval::new(0, 203)));
        assert_eq!(input.per_sub[1].read, RegionSet::from(Interval::new(196, 403)));
        let output = &result.arguments[1];
        assert_eq!(output.per_sub[1].write, RegionSet::from(Interval::new(200, 399)));
        assert!(output.full.read.is_empty());
    }

    #[test]
    fn test_overlapping_writes_block_split() {
        // Every work item writes the same accumulator slot.
        let oracle = AffineOracle::new().access(
            0,
            AccessMode::ReadWrite,
            AccessPattern::Affine {
                elem_size: 8,
                base: 0,
                offset_arg: None,
                strides: [0, 0, 0],
                halo: 0,
            },
        );
        let args = vec![KernelArg::Buffer(BufferId(7))];
        let full = WorkPartition::new(&[64], &[8]).unwrap();
        let subs = full.split_dim(0, &[0.5, 0.5]).unwrap();
        let result = oracle.analyze(&args, &full, &subs).unwrap();
        assert!(!result.can_split);
        assert!(!result.merge_legal());
    }

    #[test]
    fn test_2d_rows() {
        let oracle = AffineOracle::new().access(0, AccessMode::Write, AccessPattern::row_major(1, 16, 16));
        let args = vec![KernelArg::Buffer(BufferId(0))];
        let full = WorkPartition::new(&[8, 16], &[8, 4]).unwrap();
        let subs = full.split_dim(1, &[0.5, 0.5]).unwrap();
        let result = oracle.analyze(&args, &full, &subs).unwrap();

        // rows 0..8, columns 0..8 of a 16-wide grid
        let w = &result.arguments[0].per_sub[0].write;
        assert_eq!(w.len(), 8);
        assert_eq!(w.intervals()[0], Interval::new(0, 7));
        assert_eq!(w.intervals()[7], Interval::new(112, 119));
        assert!(result.can_split);
    }

    #[test]
    fn test_scalar_offset() {
        let oracle = AffineOracle::new().access(
            1,
            AccessMode::Read,
            AccessPattern::row_major(4, 0, 0).with_offset_arg(0),
        );
        let args = vec![KernelArg::Scalar(10), KernelArg::Buffer(BufferId(3))];
        let full = WorkPartition::new(&[4], &[1]).unwrap();
        let result = oracle.analyze(&args, &full, &[]).unwrap();
        assert_eq!(result.arguments[0].full.read, RegionSet::from(Interval::new(40, 55)));
    }

    #[test]
    fn test_unknown_pattern() {
        let oracle = AffineOracle::new().access(0, AccessMode::Read, AccessPattern::Unknown);
        let args = vec![KernelArg::Buffer(BufferId(0))];
        let full = WorkPartition::new(&[4], &[1]).unwrap();
        let err = oracle.analyze(&args, &full, &[]).unwrap_err();
        assert_eq!(err, OracleError::BoundsUnknown { arg: 0 });

        let subs = full.split_dim(0, &[0.5, 0.5]).unwrap();
        let fallback = AnalysisResult::unknown(&args, &subs);
        assert!(!fallback.can_split);
        assert!(fallback.arguments[0].per_sub[1].read.is_undefined());
        assert!(!fallback.merge_legal());
    }

    #[test]
    fn test_fallback_keeps_access_modes() {
        let oracle = AffineOracle::new()
            .access(0, AccessMode::Read, AccessPattern::Unknown)
            .access(1, AccessMode::Write, AccessPattern::row_major(4, 0, 0));
        let args = vec![KernelArg::Buffer(BufferId(0)), KernelArg::Buffer(BufferId(1))];
        let full = WorkPartition::new(&[64], &[8]).unwrap();
        let subs = full.split_dim(0, &[0.5, 0.5]).unwrap();
        assert!(oracle.analyze(&args, &full, &subs).is_err());

        let result = oracle.fallback(&args, &full, &subs);
        let input = &result.arguments[0];
        assert!(input.full.read.is_undefined());
        assert!(input.per_sub.iter().all(|s| s.read.is_undefined() && s.write.is_empty()));
        // The bounded output keeps its exact halves, so the split stays legal.
        assert_eq!(result.arguments[1].per_sub[1].write, RegionSet::from(Interval::new(128, 255)));
        assert!(result.can_split);
    }

    #[test]
    fn test_unbounded_writes_never_merge() {
        let oracle = AffineOracle::new()
            .access(0, AccessMode::Read, AccessPattern::row_major(4, 0, 0))
            .access(1, AccessMode::Write, AccessPattern::Unknown);
        let args = vec![KernelArg::Buffer(BufferId(0)), KernelArg::Buffer(BufferId(1))];
        let full = WorkPartition::new(&[64], &[8]).unwrap();
        let subs = full.split_dim(0, &[0.5, 0.5]).unwrap();

        let result = oracle.fallback(&args, &full, &subs);
        assert!(result.arguments[0].full.write.is_empty());
        assert!(result.arguments[1].full.write.is_undefined());
        assert!(!result.can_split);
        assert!(!result.merge_legal());
    }
}
