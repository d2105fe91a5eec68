//! Canonical interval sets.

use super::Interval;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a byte falls relative to the alternating gap/interval zones of a
/// canonical list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Zone {
    /// Inside `intervals[i]`.
    Inside(usize),
    /// In the gap just before `intervals[i]` (or past the end when `i == len`).
    Gap(usize),
}

/// Sorted set of disjoint, non-touching intervals.
///
/// The `undefined` flag means "the whole buffer, extent not known yet"; it
/// overrides the interval list until [`RegionSet::resolve`] turns it into a
/// concrete range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSet {
    intervals: Vec<Interval>,
    undefined: bool,
}

impl RegionSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The "whole buffer" sentinel.
    pub fn undefined() -> Self {
        Self {
            intervals: Vec::new(),
            undefined: true,
        }
    }

    /// Region covering `[0, extent - 1]`, empty for a zero extent.
    pub fn whole(extent: u64) -> Self {
        let mut set = Self::new();
        if let Some(iv) = Interval::with_len(0, extent) {
            set.add(iv);
        }
        set
    }

    /// Set holding one interval.
    pub fn from_interval(iv: Interval) -> Self {
        Self {
            intervals: vec![iv],
            undefined: false,
        }
    }

    /// Set holding the union of `intervals`.
    pub fn from_intervals<I: IntoIterator<Item = Interval>>(intervals: I) -> Self {
        let mut set = Self::new();
        for iv in intervals {
            set.add(iv);
        }
        set
    }

    /// True for the whole-buffer sentinel.
    pub fn is_undefined(&self) -> bool {
        self.undefined
    }

    /// Empty means "no bytes"; an undefined set is never empty.
    pub fn is_empty(&self) -> bool {
        !self.undefined && self.intervals.is_empty()
    }

    /// Canonical intervals, ascending.
    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    /// Iterate over the canonical intervals.
    pub fn iter(&self) -> std::slice::Iter<'_, Interval> {
        self.intervals.iter()
    }

    /// Number of disjoint intervals.
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// Total bytes covered. An undefined set reports `u64::MAX`.
    pub fn total(&self) -> u64 {
        if self.undefined {
            return u64::MAX;
        }
        self.intervals
            .iter()
            .fold(0u64, |acc, iv| acc.saturating_add(iv.len()))
    }

    /// Smallest interval covering every byte in the set.
    pub fn hull(&self) -> Option<Interval> {
        let first = self.intervals.first()?;
        let last = self.intervals.last()?;
        Some(first.hull(last))
    }

    /// Replace the undefined sentinel with `[0, extent - 1]` and clip
    /// everything else to the extent.
    pub fn resolve(&self, extent: u64) -> RegionSet {
        if self.undefined {
            RegionSet::whole(extent)
        } else {
            RegionSet::intersection(self, &RegionSet::whole(extent))
        }
    }

    fn locate(&self, byte: u64) -> Zone {
        let i = self.intervals.partition_point(|iv| iv.hb() < byte);
        match self.intervals.get(i) {
            Some(iv) if iv.lb() <= byte => Zone::Inside(i),
            _ => Zone::Gap(i),
        }
    }

    /// True when `byte` is in the set.
    pub fn contains(&self, byte: u64) -> bool {
        self.undefined || matches!(self.locate(byte), Zone::Inside(_))
    }

    /// Insert `iv`, merging every neighbour within distance 1.
    pub fn add(&mut self, iv: Interval) {
        if self.undefined {
            return;
        }
        let start = self
            .intervals
            .partition_point(|x| x.hb().saturating_add(1) < iv.lb());
        let end = self
            .intervals
            .partition_point(|x| x.lb() <= iv.hb().saturating_add(1));

        let merged = self.intervals[start..end]
            .iter()
            .fold(iv, |acc, x| acc.hull(x));
        self.intervals.splice(start..end, std::iter::once(merged));
    }

    /// Remove `iv`. Depending on where its endpoints land this deletes whole
    /// intervals, shrinks a boundary, or splits one interval in two.
    pub fn difference(&mut self, iv: Interval) {
        if self.undefined || self.intervals.is_empty() {
            return;
        }
        let lo = self.locate(iv.lb());
        let hi = self.locate(iv.hb());

        let (start, keep_left) = match lo {
            Zone::Inside(i) => {
                let cur = self.intervals[i];
                let left = (cur.lb() < iv.lb()).then(|| Interval::new(cur.lb(), iv.lb() - 1));
                (i, left)
            }
            Zone::Gap(i) => (i, None),
        };
        let (end, keep_right) = match hi {
            Zone::Inside(j) => {
                let cur = self.intervals[j];
                let right = (cur.hb() > iv.hb()).then(|| Interval::new(iv.hb() + 1, cur.hb()));
                (j + 1, right)
            }
            Zone::Gap(j) => (j, None),
        };
        if start >= end {
            return;
        }

        self.intervals
            .splice(start..end, keep_left.into_iter().chain(keep_right));
    }

    /// Remove every interval of `other`. Removing an undefined set empties
    /// `self`.
    pub fn difference_set(&mut self, other: &RegionSet) {
        if other.undefined {
            self.intervals.clear();
            self.undefined = false;
            return;
        }
        for iv in &other.intervals {
            self.difference(*iv);
        }
    }

    /// `self \ other` as a new set.
    pub fn minus(&self, other: &RegionSet) -> RegionSet {
        let mut out = self.clone();
        out.difference_set(other);
        out
    }

    /// In-place union.
    pub fn union_with(&mut self, other: &RegionSet) {
        if other.undefined {
            *self = RegionSet::undefined();
            return;
        }
        for iv in &other.intervals {
            self.add(*iv);
        }
    }

    /// Bytes in either set.
    pub fn union(&self, other: &RegionSet) -> RegionSet {
        let mut out = self.clone();
        out.union_with(other);
        out
    }

    /// Intersection of two sets. An undefined side acts as the identity.
    pub fn intersection(a: &RegionSet, b: &RegionSet) -> RegionSet {
        match (a.undefined, b.undefined) {
            (true, true) => return RegionSet::undefined(),
            (true, false) => return b.clone(),
            (false, true) => return a.clone(),
            (false, false) => {}
        }

        let mut out = RegionSet::new();
        let (mut i, mut j) = (0, 0);
        while i < a.intervals.len() && j < b.intervals.len() {
            let (x, y) = (a.intervals[i], b.intervals[j]);
            if let Some(common) = x.intersection(&y) {
                out.add(common);
            }
            if x.hb() < y.hb() {
                i += 1;
            } else {
                j += 1;
            }
        }
        out
    }

    /// True when the sets share a byte.
    pub fn overlaps(&self, other: &RegionSet) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        !RegionSet::intersection(self, other).is_empty()
    }

    /// True when every byte of `other` is also in `self`.
    pub fn covers(&self, other: &RegionSet) -> bool {
        if self.undefined {
            return true;
        }
        if other.undefined {
            return false;
        }
        other.minus(self).is_empty()
    }

    /// Sorted, disjoint and non-touching.
    pub fn is_canonical(&self) -> bool {
        self.intervals
            .windows(2)
            .all(|w| w[0].hb().saturating_add(1) < w[1].lb())
    }
}

impl From<Interval> for RegionSet {
    fn from(iv: Interval) -> Self {
        RegionSet::from_interval(iv)
    }
}

impl FromIterator<Interval> for RegionSet {
    fn from_iter<I: IntoIterator<Item = Interval>>(iter: I) -> Self {
        RegionSet::from_intervals(iter)
    }
}

impl<'a> IntoIterator for &'a RegionSet {
    type Item = &'a Interval;
    type IntoIter = std::slice::Iter<'a, Interval>;

    fn into_iter(self) -> Self::IntoIter {
        self.intervals.iter()
    }
}

impl fmt::Display for RegionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.undefined {
            return f.write_str("{undefined}");
        }
        f.write_str("{")?;
        for (i, iv) in self.intervals.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", iv)?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ivs: &[(u64, u64)]) -> RegionSet {
        ivs.iter().map(|&(l, h)| Interval::new(l, h)).collect()
    }

    #[test]
    fn test_add_merges_touching() {
        let mut s = RegionSet::new();
        s.add(Interval::new(0, 9));
        s.add(Interval::new(20, 29));
        assert_eq!(s.len(), 2);
        s.add(Interval::new(10, 19));
        assert_eq!(s.intervals(), &[Interval::new(0, 29)]);
    }

    #[test]
    fn test_add_spanning_several() {
        let mut s = set(&[(0, 1), (5, 6), (10, 11), (20, 21)]);
        s.add(Interval::new(3, 12));
        assert_eq!(s, set(&[(0, 1), (3, 12), (20, 21)]));
        assert!(s.is_canonical());
    }

    #[test]
    fn test_difference_cases() {
        // full removal
        let mut s = set(&[(0, 9), (20, 29)]);
        s.difference(Interval::new(18, 31));
        assert_eq!(s, set(&[(0, 9)]));

        // boundary shrink
        let mut s = set(&[(0, 9)]);
        s.difference(Interval::new(5, 15));
        assert_eq!(s, set(&[(0, 4)]));

        // interior split
        let mut s = set(&[(0, 9)]);
        s.difference(Interval::new(3, 5));
        assert_eq!(s, set(&[(0, 2), (6, 9)]));

        // span across several
        let mut s = set(&[(0, 9), (20, 29), (40, 49), (60, 69)]);
        s.difference(Interval::new(5, 45));
        assert_eq!(s, set(&[(0, 4), (46, 49), (60, 69)]));
    }

    #[test]
    fn test_difference_in_gap_is_noop() {
        let mut s = set(&[(0, 9), (20, 29)]);
        s.difference(Interval::new(11, 18));
        assert_eq!(s, set(&[(0, 9), (20, 29)]));
    }

    #[test]
    fn test_intersection() {
        let a = set(&[(0, 9), (20, 29)]);
        let b = set(&[(5, 24)]);
        assert_eq!(RegionSet::intersection(&a, &b), set(&[(5, 9), (20, 24)]));
    }

    #[test]
    fn test_undefined_short_circuits() {
        let mut u = RegionSet::undefined();
        u.add(Interval::new(0, 3));
        assert!(u.is_undefined());
        assert_eq!(u.total(), u64::MAX);

        let a = set(&[(0, 9)]);
        assert_eq!(RegionSet::intersection(&a, &u), a);
        assert!(a.union(&u).is_undefined());
        assert!(a.minus(&u).is_empty());
        assert_eq!(u.resolve(16), set(&[(0, 15)]));
    }

    #[test]
    fn test_resolve_clips() {
        let a = set(&[(0, 9), (90, 120)]);
        assert_eq!(a.resolve(100), set(&[(0, 9), (90, 99)]));
    }

    #[test]
    fn test_total_of_full_range() {
        let set = RegionSet::from(Interval::new(0, u64::MAX));
        assert_eq!(set.total(), u64::MAX);
        assert!(set.contains(u64::MAX));
    }

    #[test]
    fn test_covers() {
        let a = set(&[(0, 99)]);
        assert!(a.covers(&set(&[(10, 20), (50, 60)])));
        assert!(!a.covers(&set(&[(90, 100)])));
        assert!(!a.covers(&RegionSet::undefined()));
    }

    #[test]
    fn test_display() {
        assert_eq!(set(&[(0, 1), (4, 5)]).to_string(), "{[0,1], [4,5]}");
        assert_eq!(RegionSet::undefined().to_string(), "{undefined}");
    }
}
