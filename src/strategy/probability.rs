//! Implied probability for directional up/down windows
//!
//! Maps the reference price's percentage deviation from the window's open
//! price through a logistic curve. Steepness grows with `1/√(time remaining)`,
//! so the same deviation implies more confidence as the window nears close:
//!
//! ```text
//! dev  = (St - S0) / S0 * 100
//! k    = steepness * sqrt(reference_secs / remaining_secs)
//! P_up = 1 / (1 + exp(-k * dev))
//! ```

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::ArbitrageConfig;
use crate::domain::Side;

/// Remaining time is floored at this value to keep `k` finite
const MIN_REMAINING_SECS: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImpliedProbabilityModel {
    pub steepness: f64,
    pub reference_secs: f64,
}

/// Implied probability with the inputs that produced it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImpliedEstimate {
    pub deviation_pct: f64,
    pub steepness: f64,
    pub p_up: f64,
}

impl ImpliedEstimate {
    pub fn probability(&self, side: Side) -> f64 {
        match side {
            Side::Up => self.p_up,
            Side::Down => 1.0 - self.p_up,
        }
    }

    /// Side the model favors and its probability (ties go to UP)
    pub fn leader(&self) -> (Side, f64) {
        if self.p_up >= 0.5 {
            (Side::Up, self.p_up)
        } else {
            (Side::Down, 1.0 - self.p_up)
        }
    }
}

impl ImpliedProbabilityModel {
    pub fn new(steepness: f64, reference_secs: f64) -> Self {
        Self {
            steepness,
            reference_secs,
        }
    }

    pub fn from_config(config: &ArbitrageConfig) -> Self {
        Self::new(config.steepness, config.reference_secs)
    }

    /// Effective steepness at `remaining_secs`
    pub fn steepness_at(&self, remaining_secs: f64) -> f64 {
        let remaining = remaining_secs.max(MIN_REMAINING_SECS);
        self.steepness * (self.reference_secs / remaining).sqrt()
    }

    /// P(up) for a given percentage deviation from the open
    pub fn p_up_for_deviation(&self, deviation_pct: f64, remaining_secs: f64) -> f64 {
        logistic(self.steepness_at(remaining_secs) * deviation_pct)
    }

    /// Estimate from the open and current reference price.
    ///
    /// `None` if either price is missing or not positive.
    pub fn estimate(
        &self,
        open: Decimal,
        reference: Decimal,
        remaining_secs: f64,
    ) -> Option<ImpliedEstimate> {
        let open = open.to_f64()?;
        let reference = reference.to_f64()?;
        if open <= 0.0 || reference <= 0.0 {
            return None;
        }

        let deviation_pct = (reference - open) / open * 100.0;
        let steepness = self.steepness_at(remaining_secs);
        Some(ImpliedEstimate {
            deviation_pct,
            steepness,
            p_up: logistic(steepness * deviation_pct),
        })
    }
}

fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Model probability as a Decimal, rounded to 4 places
pub fn to_decimal(p: f64) -> Decimal {
    Decimal::try_from(p)
        .map(|d| d.round_dp(4))
        .unwrap_or(Decimal::ZERO)
}
