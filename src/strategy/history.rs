//! Bounded ring of odds samples used for sustained-condition and momentum checks.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::domain::{OddsState, Side};

/// One periodic snapshot of the odds pair plus the reference price
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OddsSample {
    pub at: DateTime<Utc>,
    pub up: Decimal,
    pub down: Decimal,
    pub reference: Option<Decimal>,
}

impl OddsSample {
    /// Build a sample from a complete odds pair
    pub fn from_odds(
        odds: &OddsState,
        reference: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> Option<Self> {
        Some(Self {
            at,
            up: odds.up?,
            down: odds.down?,
            reference,
        })
    }

    pub fn get(&self, side: Side) -> Decimal {
        match side {
            Side::Up => self.up,
            Side::Down => self.down,
        }
    }
}

/// Fixed-capacity, insertion-ordered sample ring (oldest evicted first)
#[derive(Debug, Clone)]
pub struct OddsHistory {
    samples: VecDeque<OddsSample>,
    capacity: usize,
}

impl OddsHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: OddsSample) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&OddsSample> {
        self.samples.back()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// The newest `k` samples, oldest first. `None` if fewer than `k` exist.
    pub fn last_n(&self, k: usize) -> Option<impl Iterator<Item = &OddsSample>> {
        if k == 0 || self.samples.len() < k {
            return None;
        }
        Some(self.samples.iter().skip(self.samples.len() - k))
    }

    /// Side whose probability stayed at or above `bound` on each of the last `k` samples.
    ///
    /// Returns the side and its newest value.
    pub fn sustained_above(&self, bound: Decimal, k: usize) -> Option<(Side, Decimal)> {
        [Side::Up, Side::Down].into_iter().find_map(|side| {
            let mut window = self.last_n(k)?;
            if window.all(|s| s.get(side) >= bound) {
                self.latest().map(|s| (side, s.get(side)))
            } else {
                None
            }
        })
    }

    /// Change of `side` between the oldest and newest of the last `k` samples
    pub fn delta(&self, side: Side, k: usize) -> Option<Decimal> {
        let window: Vec<&OddsSample> = self.last_n(k)?.collect();
        let first = window.first()?;
        let last = window.last()?;
        Some(last.get(side) - first.get(side))
    }

    /// Change of `side` across the whole ring
    pub fn momentum(&self, side: Side) -> Option<Decimal> {
        self.delta(side, self.samples.len())
    }

    /// Side that rose by at least `threshold` within the last `k` samples.
    /// The larger rise wins if both qualify.
    pub fn surge(&self, threshold: Decimal, k: usize) -> Option<(Side, Decimal)> {
        let up = self.delta(Side::Up, k)?;
        let down = self.delta(Side::Down, k)?;
        let (side, rise) = if up >= down {
            (Side::Up, up)
        } else {
            (Side::Down, down)
        };
        (rise >= threshold).then_some((side, rise))
    }

    pub fn iter(&self) -> impl Iterator<Item = &OddsSample> {
        self.samples.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample(up: Decimal) -> OddsSample {
        OddsSample {
            at: Utc::now(),
            up,
            down: Decimal::ONE - up,
            reference: None,
        }
    }

    fn history(values: &[Decimal]) -> OddsHistory {
        let mut h = OddsHistory::new(10);
        for v in values {
            h.push(sample(*v));
        }
        h
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let mut h = OddsHistory::new(3);
        for i in 0..10 {
            h.push(sample(Decimal::new(i, 1)));
            assert!(h.len() <= 3);
        }
        let ups: Vec<Decimal> = h.iter().map(|s| s.up).collect();
        assert_eq!(ups, vec![dec!(0.7), dec!(0.8), dec!(0.9)]);
    }

    #[test]
    fn test_sustained_requires_every_sample() {
        let h = history(&[dec!(0.95), dec!(0.93), dec!(0.95)]);
        assert!(h.sustained_above(dec!(0.94), 3).is_none());

        let h = history(&[dec!(0.80), dec!(0.95), dec!(0.96), dec!(0.95)]);
        assert_eq!(h.sustained_above(dec!(0.94), 3), Some((Side::Up, dec!(0.95))));
    }

    #[test]
    fn test_sustained_detects_down_side() {
        let h = history(&[dec!(0.05), dec!(0.04), dec!(0.03)]);
        assert_eq!(h.sustained_above(dec!(0.94), 3), Some((Side::Down, dec!(0.97))));
    }

    #[test]
    fn test_sustained_needs_enough_samples() {
        let h = history(&[dec!(0.99), dec!(0.99)]);
        assert!(h.sustained_above(dec!(0.94), 3).is_none());
    }

    #[test]
    fn test_surge_and_momentum() {
        let h = history(&[dec!(0.50), dec!(0.40), dec!(0.45), dec!(0.62)]);
        assert_eq!(h.delta(Side::Up, 3), Some(dec!(0.22)));
        assert_eq!(h.surge(dec!(0.15), 3), Some((Side::Up, dec!(0.22))));
        assert_eq!(h.momentum(Side::Down), Some(dec!(-0.12)));

        let flat = history(&[dec!(0.50), dec!(0.52), dec!(0.55)]);
        assert!(flat.surge(dec!(0.15), 3).is_none());
    }

    #[test]
    fn test_from_odds_requires_both_sides() {
        let mut odds = OddsState::default();
        assert!(OddsSample::from_odds(&odds, None, Utc::now()).is_none());
        odds.apply(Side::Up, dec!(0.6), Utc::now());
        let s = OddsSample::from_odds(&odds, Some(dec!(97000)), Utc::now()).unwrap();
        assert_eq!(s.down, dec!(0.4));
    }
}
