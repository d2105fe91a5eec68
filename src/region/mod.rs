//! Interval-set region algebra.
//!
//! Regions describe byte ranges of a buffer. They are plain values: every
//! operation returns a canonical set (sorted, disjoint, non-touching).

pub mod interval;
pub mod set;

pub use interval::Interval;
pub use set::RegionSet;
