use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Side of the binary market (UP or DOWN)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Up,
    Down,
}

impl Side {
    /// Get the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            Side::Up => Side::Down,
            Side::Down => Side::Up,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Up => "UP",
            Side::Down => "DOWN",
        }
    }

    /// Side favored by a reference price sitting `delta` away from the open
    pub fn from_delta(delta: Decimal) -> Option<Self> {
        if delta > Decimal::ZERO {
            Some(Side::Up)
        } else if delta < Decimal::ZERO {
            Some(Side::Down)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One recurring, time-boxed up/down market.
///
/// Everything except `price_to_beat` is fixed at creation. The price to beat
/// is filled in once, asynchronously, after the window has been activated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketWindow {
    /// Stable identifier (the event slug)
    pub id: String,
    pub title: String,
    pub condition_id: Option<String>,
    pub up_token_id: String,
    pub down_token_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Odds pair reported by discovery, `(up, down)`
    pub initial_odds: Option<(Decimal, Decimal)>,
    price_to_beat: Option<Decimal>,
}

impl MarketWindow {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        up_token_id: impl Into<String>,
        down_token_id: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            condition_id: None,
            up_token_id: up_token_id.into(),
            down_token_id: down_token_id.into(),
            start_time,
            end_time,
            initial_odds: None,
            price_to_beat: None,
        }
    }

    pub fn with_condition_id(mut self, condition_id: impl Into<String>) -> Self {
        self.condition_id = Some(condition_id.into());
        self
    }

    pub fn with_initial_odds(mut self, up: Decimal, down: Decimal) -> Self {
        self.initial_odds = Some((up, down));
        self
    }

    /// Get token ID for a given side
    pub fn token_id(&self, side: Side) -> &str {
        match side {
            Side::Up => &self.up_token_id,
            Side::Down => &self.down_token_id,
        }
    }

    /// Map a token ID back to its side, if it belongs to this window
    pub fn side_of(&self, token_id: &str) -> Option<Side> {
        if token_id == self.up_token_id {
            Some(Side::Up)
        } else if token_id == self.down_token_id {
            Some(Side::Down)
        } else {
            None
        }
    }

    pub fn price_to_beat(&self) -> Option<Decimal> {
        self.price_to_beat
    }

    /// Record the price to beat. Returns false if it was already known.
    pub fn set_price_to_beat(&mut self, price: Decimal) -> bool {
        if self.price_to_beat.is_some() {
            return false;
        }
        self.price_to_beat = Some(price);
        true
    }

    /// Seconds remaining until the window closes (fractional, never negative)
    pub fn seconds_remaining_at(&self, now: DateTime<Utc>) -> f64 {
        ((self.end_time - now).num_milliseconds() as f64 / 1000.0).max(0.0)
    }

    pub fn seconds_remaining(&self) -> f64 {
        self.seconds_remaining_at(Utc::now())
    }

    /// Seconds since the window opened
    pub fn seconds_elapsed_at(&self, now: DateTime<Utc>) -> f64 {
        ((now - self.start_time).num_milliseconds() as f64 / 1000.0).max(0.0)
    }
}

/// Probability-like odds for both sides of the current window.
///
/// Every write sets one side and derives the other as its complement, so
/// `up + down == 1` holds whenever both are known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OddsState {
    pub up: Option<Decimal>,
    pub down: Option<Decimal>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl OddsState {
    /// Set `side` to `value` (clamped into [0, 1]) and its complement to `1 - value`
    pub fn apply(&mut self, side: Side, value: Decimal, at: DateTime<Utc>) {
        let value = value.clamp(Decimal::ZERO, Decimal::ONE);
        let complement = Decimal::ONE - value;
        match side {
            Side::Up => {
                self.up = Some(value);
                self.down = Some(complement);
            }
            Side::Down => {
                self.down = Some(value);
                self.up = Some(complement);
            }
        }
        self.updated_at = Some(at);
    }

    pub fn get(&self, side: Side) -> Option<Decimal> {
        match side {
            Side::Up => self.up,
            Side::Down => self.down,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.up.is_some() && self.down.is_some()
    }

    /// Higher-probability side and its probability. Ties go to UP.
    pub fn leader(&self) -> Option<(Side, Decimal)> {
        match (self.up, self.down) {
            (Some(up), Some(down)) if up >= down => Some((Side::Up, up)),
            (Some(_), Some(down)) => Some((Side::Down, down)),
            _ => None,
        }
    }
}

/// Best bid/ask for one side
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Quote {
    /// Get mid price
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            (Some(bid), None) => Some(bid),
            (None, Some(ask)) => Some(ask),
            (None, None) => None,
        }
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn window() -> MarketWindow {
        let start = Utc::now();
        MarketWindow::new(
            "btc-updown-15m-1",
            "Bitcoin Up or Down",
            "up-token",
            "down-token",
            start,
            start + Duration::minutes(15),
        )
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Up.opposite(), Side::Down);
        assert_eq!(Side::Down.opposite(), Side::Up);
    }

    #[test]
    fn test_side_from_delta() {
        assert_eq!(Side::from_delta(dec!(12.5)), Some(Side::Up));
        assert_eq!(Side::from_delta(dec!(-0.01)), Some(Side::Down));
        assert_eq!(Side::from_delta(Decimal::ZERO), None);
    }

    #[test]
    fn test_odds_apply_keeps_sum_at_one() {
        let now = Utc::now();
        let mut odds = OddsState::default();

        for (side, value) in [
            (Side::Up, dec!(0.615)),
            (Side::Down, dec!(0.2)),
            (Side::Up, dec!(0.999)),
            (Side::Down, dec!(0.5)),
        ] {
            odds.apply(side, value, now);
            assert_eq!(odds.up.unwrap() + odds.down.unwrap(), Decimal::ONE);
            assert_eq!(odds.get(side), Some(value));
        }
    }

    #[test]
    fn test_odds_apply_clamps_out_of_range() {
        let mut odds = OddsState::default();
        odds.apply(Side::Up, dec!(1.2), Utc::now());
        assert_eq!(odds.up, Some(Decimal::ONE));
        assert_eq!(odds.down, Some(Decimal::ZERO));
    }

    #[test]
    fn test_odds_leader() {
        let mut odds = OddsState::default();
        assert!(odds.leader().is_none());

        odds.apply(Side::Down, dec!(0.7), Utc::now());
        assert_eq!(odds.leader(), Some((Side::Down, dec!(0.7))));

        odds.apply(Side::Up, dec!(0.5), Utc::now());
        assert_eq!(odds.leader(), Some((Side::Up, dec!(0.5))));
    }

    #[test]
    fn test_window_token_mapping() {
        let w = window();
        assert_eq!(w.token_id(Side::Up), "up-token");
        assert_eq!(w.side_of("down-token"), Some(Side::Down));
        assert_eq!(w.side_of("other"), None);
    }

    #[test]
    fn test_price_to_beat_set_once() {
        let mut w = window();
        assert!(w.price_to_beat().is_none());
        assert!(w.set_price_to_beat(dec!(97000)));
        assert!(!w.set_price_to_beat(dec!(1)));
        assert_eq!(w.price_to_beat(), Some(dec!(97000)));
    }

    #[test]
    fn test_seconds_remaining() {
        let w = window();
        let now = w.start_time + Duration::seconds(600);
        assert!((w.seconds_remaining_at(now) - 300.0).abs() < 1e-9);
        assert!((w.seconds_elapsed_at(now) - 600.0).abs() < 1e-9);
        assert_eq!(w.seconds_remaining_at(w.end_time + Duration::seconds(5)), 0.0);
    }

    #[test]
    fn test_quote_mid() {
        let quote = Quote {
            best_bid: Some(dec!(0.44)),
            best_ask: Some(dec!(0.46)),
            timestamp: None,
        };
        assert_eq!(quote.mid_price(), Some(dec!(0.45)));
        assert_eq!(quote.spread(), Some(dec!(0.02)));
    }
}
