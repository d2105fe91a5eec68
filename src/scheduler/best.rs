//! Best-so-far granularity tracking.

use super::Granularity;

/// Tracks the lowest makespan seen and how long it has gone unbeaten.
#[derive(Debug, Clone)]
pub struct BestTracker {
    best: Option<(Granularity, f64)>,
    since_improvement: u32,
    patience: u32,
}

impl BestTracker {
    /// Tracker that reports a stall after `patience` reports without improvement.
    pub fn new(patience: u32) -> Self {
        Self {
            best: None,
            since_improvement: 0,
            patience,
        }
    }

    /// Record one iteration. Returns true if it set a new best.
    pub fn observe(&mut self, granularity: &Granularity, makespan: f64) -> bool {
        if !makespan.is_finite() {
            self.since_improvement += 1;
            return false;
        }
        let improved = match &self.best {
            Some((_, best)) => makespan < *best,
            None => true,
        };
        if improved {
            self.best = Some((granularity.clone(), makespan));
            self.since_improvement = 0;
        } else {
            self.since_improvement += 1;
        }
        improved
    }

    /// Fastest granularity seen and its makespan.
    pub fn best(&self) -> Option<(&Granularity, f64)> {
        self.best.as_ref().map(|(g, t)| (g, *t))
    }

    /// Reports since the last improvement.
    pub fn since_improvement(&self) -> u32 {
        self.since_improvement
    }

    /// No improvement for `patience` consecutive iterations.
    pub fn stalled(&self) -> bool {
        self.best.is_some() && self.since_improvement >= self.patience
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_and_stall() {
        let mut tracker = BestTracker::new(2);
        let a = Granularity::uniform(2);
        let b = Granularity::from_shares(&[0.3, 0.7]).unwrap();

        assert!(tracker.observe(&a, 10.0));
        assert!(tracker.observe(&b, 6.0));
        assert!(!tracker.observe(&a, 7.0));
        assert!(!tracker.stalled());
        assert!(!tracker.observe(&a, f64::NAN));
        assert!(tracker.stalled());

        let (g, t) = tracker.best().unwrap();
        assert_eq!(g, &b);
        assert_eq!(t, 6.0);
    }
}
