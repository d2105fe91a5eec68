//! Closed byte intervals.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Inclusive byte range `[lb, hb]` with `lb <= hb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Interval {
    lb: u64,
    hb: u64,
}

impl Interval {
    /// Create an interval, swapping the bounds if they arrive reversed.
    pub fn new(lb: u64, hb: u64) -> Self {
        if lb <= hb {
            Self { lb, hb }
        } else {
            Self { lb: hb, hb: lb }
        }
    }

    /// Interval covering `len` bytes starting at `start`. `None` for `len == 0`.
    pub fn with_len(start: u64, len: u64) -> Option<Self> {
        if len == 0 {
            return None;
        }
        Some(Self::new(start, start.saturating_add(len - 1)))
    }

    /// First byte.
    pub fn lb(&self) -> u64 {
        self.lb
    }

    /// Last byte, inclusive.
    pub fn hb(&self) -> u64 {
        self.hb
    }

    /// Number of bytes covered. `[0, u64::MAX]` saturates at `u64::MAX`.
    pub fn len(&self) -> u64 {
        (self.hb - self.lb).saturating_add(1)
    }

    /// True when `byte` lies inside.
    pub fn contains(&self, byte: u64) -> bool {
        self.lb <= byte && byte <= self.hb
    }

    /// True when the two intervals share a byte.
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.lb <= other.hb && other.lb <= self.hb
    }

    /// True when the two intervals overlap or sit at distance 1 and
    /// would merge into one.
    pub fn touches(&self, other: &Interval) -> bool {
        self.lb <= other.hb.saturating_add(1) && other.lb <= self.hb.saturating_add(1)
    }

    /// Bytes in both intervals.
    pub fn intersection(&self, other: &Interval) -> Option<Interval> {
        if !self.overlaps(other) {
            return None;
        }
        Some(Interval {
            lb: self.lb.max(other.lb),
            hb: self.hb.min(other.hb),
        })
    }

    /// Smallest interval covering both.
    pub fn hull(&self, other: &Interval) -> Interval {
        Interval {
            lb: self.lb.min(other.lb),
            hb: self.hb.max(other.hb),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.lb, self.hb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reversed_bounds() {
        let i = Interval::new(9, 3);
        assert_eq!(i.lb(), 3);
        assert_eq!(i.hb(), 9);
        assert_eq!(i.len(), 7);
    }

    #[test]
    fn test_touching() {
        let a = Interval::new(0, 9);
        assert!(a.touches(&Interval::new(10, 19)));
        assert!(!a.touches(&Interval::new(11, 19)));
        assert!(!a.overlaps(&Interval::new(10, 19)));
    }

    #[test]
    fn test_len_of_full_range() {
        assert_eq!(Interval::new(0, u64::MAX).len(), u64::MAX);
        assert_eq!(Interval::new(u64::MAX, u64::MAX).len(), 1);
    }

    #[test]
    fn test_with_len() {
        assert_eq!(Interval::with_len(4, 0), None);
        assert_eq!(Interval::with_len(4, 4), Some(Interval::new(4, 7)));
    }
}
