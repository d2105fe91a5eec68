//! N-dimensional index spaces and weighted splitting.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Highest supported work dimension.
pub const MAX_DIMS: usize = 3;

/// An n-dim (n <= 3) index space: global size, work-group size and offset
/// per dimension, plus the global size before any splitting.
///
/// Unused dimensions carry size 1, local size 1 and offset 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkPartition {
    work_dim: usize,
    global_size: [u64; MAX_DIMS],
    local_size: [u64; MAX_DIMS],
    offset: [u64; MAX_DIMS],
    original_global_size: [u64; MAX_DIMS],
}

impl WorkPartition {
    /// Create a partition. Every global size must be a multiple of its local
    /// size.
    pub fn new(global: &[u64], local: &[u64]) -> Result<Self> {
        let offset = vec![0; global.len()];
        Self::with_offset(global, local, &offset)
    }

    /// Partition starting at `offset` instead of the origin.
    pub fn with_offset(global: &[u64], local: &[u64], offset: &[u64]) -> Result<Self> {
        let work_dim = global.len();
        if work_dim == 0 || work_dim > MAX_DIMS {
            return Err(Error::invalid_partition(format!(
                "work_dim must be 1..={}, got {}",
                MAX_DIMS, work_dim
            )));
        }
        if local.len() != work_dim || offset.len() != work_dim {
            return Err(Error::invalid_partition(
                "global, local and offset must have the same length",
            ));
        }

        let mut p = WorkPartition {
            work_dim,
            global_size: [1; MAX_DIMS],
            local_size: [1; MAX_DIMS],
            offset: [0; MAX_DIMS],
            original_global_size: [1; MAX_DIMS],
        };
        for d in 0..work_dim {
            if local[d] == 0 {
                return Err(Error::invalid_partition(format!("local size of dim {} is 0", d)));
            }
            if global[d] % local[d] != 0 {
                return Err(Error::invalid_partition(format!(
                    "global size {} of dim {} is not a multiple of local size {}",
                    global[d], d, local[d]
                )));
            }
            p.global_size[d] = global[d];
            p.local_size[d] = local[d];
            p.offset[d] = offset[d];
            p.original_global_size[d] = global[d];
        }
        Ok(p)
    }

    /// Number of dimensions in use.
    pub fn work_dim(&self) -> usize {
        self.work_dim
    }

    /// Work items per dimension.
    pub fn global_size(&self) -> &[u64] {
        &self.global_size[..self.work_dim]
    }

    /// Work-group size per dimension.
    pub fn local_size(&self) -> &[u64] {
        &self.local_size[..self.work_dim]
    }

    /// First work item per dimension.
    pub fn offset(&self) -> &[u64] {
        &self.offset[..self.work_dim]
    }

    /// Global size before splitting; kernels use it to rebuild group ids.
    pub fn original_global_size(&self) -> &[u64] {
        &self.original_global_size[..self.work_dim]
    }

    /// Work groups along `dim`.
    pub fn groups(&self, dim: usize) -> u64 {
        self.global_size[dim] / self.local_size[dim]
    }

    /// Index of the first work group along `dim`, relative to the unsplit space.
    pub fn group_offset(&self, dim: usize) -> u64 {
        self.offset[dim] / self.local_size[dim]
    }

    /// Work items over all dimensions.
    pub fn total_items(&self) -> u64 {
        self.global_size[..self.work_dim].iter().product()
    }

    /// A partition with no work items: the device idles this iteration.
    pub fn is_empty(&self) -> bool {
        self.total_items() == 0
    }

    /// Dimensions ordered by descending work-group count. Ties keep the lower
    /// dimension first.
    pub fn dims_by_parallelism(&self) -> Vec<usize> {
        let mut dims: Vec<usize> = (0..self.work_dim).collect();
        dims.sort_by(|&a, &b| self.groups(b).cmp(&self.groups(a)));
        dims
    }

    /// Split `dim` into `weights.len()` contiguous sub-partitions.
    ///
    /// Each weight is scaled to the work-group count and floored; the last
    /// piece takes the remainder. Sizes are multiples of the local size and
    /// together cover the range exactly. Zero-size pieces are legal.
    pub fn split_dim(&self, dim: usize, weights: &[f64]) -> Result<Vec<WorkPartition>> {
        if dim >= self.work_dim {
            return Err(Error::invalid_partition(format!(
                "cannot split dim {} of a {}-dim partition",
                dim, self.work_dim
            )));
        }
        if weights.is_empty() {
            return Err(Error::invalid_partition("no split weights"));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::invalid_partition(format!(
                "split weights must be finite and >= 0: {:?}",
                weights
            )));
        }
        let sum: f64 = weights.iter().sum();
        if sum <= 0.0 {
            return Err(Error::invalid_partition("split weights sum to 0"));
        }

        let groups = self.groups(dim);
        let local = self.local_size[dim];
        let last = weights.len() - 1;
        let mut assigned = 0u64;
        let mut pieces = Vec::with_capacity(weights.len());

        for (i, w) in weights.iter().enumerate() {
            let remaining = groups - assigned;
            let g = if i == last {
                remaining
            } else {
                ((w / sum) * groups as f64).floor().min(remaining as f64) as u64
            };

            let mut piece = self.clone();
            piece.global_size[dim] = g * local;
            piece.offset[dim] = self.offset[dim] + assigned * local;
            pieces.push(piece);
            assigned += g;
        }

        Ok(pieces)
    }
}

/// Fraction of the parent's work each piece received along `dim`.
pub fn shares_of(parent: &WorkPartition, pieces: &[WorkPartition], dim: usize) -> Vec<f64> {
    let total = parent.global_size[dim] as f64;
    if total == 0.0 {
        return vec![0.0; pieces.len()];
    }
    pieces
        .iter()
        .map(|p| p.global_size[dim] as f64 / total)
        .collect()
}
