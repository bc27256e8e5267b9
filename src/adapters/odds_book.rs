//! Live odds and top-of-book for the active window.
//!
//! Written by the odds feed, read by the engine and the paper exchange. The
//! odds pair lives under a single lock so readers never see a half-applied
//! update.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

use crate::domain::{MarketWindow, OddsState, Quote, Side};
use crate::exchange::LivePriceSource;

#[derive(Debug, Default)]
struct BookInner {
    window_id: Option<String>,
    up_token_id: String,
    down_token_id: String,
    odds: OddsState,
    up: Quote,
    down: Quote,
}

impl BookInner {
    fn side_of(&self, token_id: &str) -> Option<Side> {
        if self.window_id.is_none() {
            return None;
        }
        if token_id == self.up_token_id {
            Some(Side::Up)
        } else if token_id == self.down_token_id {
            Some(Side::Down)
        } else {
            None
        }
    }

    fn quote(&self, side: Side) -> &Quote {
        match side {
            Side::Up => &self.up,
            Side::Down => &self.down,
        }
    }

    fn quote_mut(&mut self, side: Side) -> &mut Quote {
        match side {
            Side::Up => &mut self.up,
            Side::Down => &mut self.down,
        }
    }
}

/// Point-in-time copy of the book
#[derive(Debug, Clone, Default, Serialize)]
pub struct BookSnapshot {
    pub window_id: Option<String>,
    pub odds: OddsState,
    pub up: Quote,
    pub down: Quote,
}

impl BookSnapshot {
    pub fn quote(&self, side: Side) -> &Quote {
        match side {
            Side::Up => &self.up,
            Side::Down => &self.down,
        }
    }

    /// Best ask for `side`, falling back to its probability
    pub fn ask_or_probability(&self, side: Side) -> Option<Decimal> {
        self.quote(side).best_ask.or_else(|| self.odds.get(side))
    }
}

/// Thread-safe odds book for the current window
#[derive(Debug, Clone, Default)]
pub struct OddsBook {
    inner: Arc<RwLock<BookInner>>,
}

impl OddsBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the book at a new window, dropping everything from the previous one.
    ///
    /// Seeds the odds with the pair reported by discovery, if any.
    pub fn reset(&self, window: &MarketWindow) {
        let mut inner = self.inner.write();
        *inner = BookInner {
            window_id: Some(window.id.clone()),
            up_token_id: window.up_token_id.clone(),
            down_token_id: window.down_token_id.clone(),
            ..BookInner::default()
        };
        if let Some((up, _down)) = window.initial_odds {
            inner.odds.apply(Side::Up, up, Utc::now());
        }
    }

    pub fn clear(&self) {
        *self.inner.write() = BookInner::default();
    }

    pub fn window_id(&self) -> Option<String> {
        self.inner.read().window_id.clone()
    }

    pub fn side_of(&self, token_id: &str) -> Option<Side> {
        self.inner.read().side_of(token_id)
    }

    /// Apply a last-traded price. Returns the side it belonged to.
    pub fn apply_probability(
        &self,
        token_id: &str,
        value: Decimal,
        at: DateTime<Utc>,
    ) -> Option<Side> {
        let mut inner = self.inner.write();
        let side = inner.side_of(token_id)?;
        inner.odds.apply(side, value, at);
        Some(side)
    }

    /// Apply a best bid/ask update; the probability becomes the midpoint.
    ///
    /// Returns the side it belonged to, or `None` for unknown tokens and
    /// empty updates.
    pub fn apply_top(
        &self,
        token_id: &str,
        best_bid: Option<Decimal>,
        best_ask: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> Option<Side> {
        let mut inner = self.inner.write();
        let side = inner.side_of(token_id)?;

        let quote = Quote {
            best_bid,
            best_ask,
            timestamp: Some(at),
        };
        let mid = quote.mid_price()?;
        *inner.quote_mut(side) = quote;
        inner.odds.apply(side, mid, at);
        Some(side)
    }

    pub fn odds(&self) -> OddsState {
        self.inner.read().odds
    }

    pub fn quote(&self, side: Side) -> Quote {
        *self.inner.read().quote(side)
    }

    pub fn snapshot(&self) -> BookSnapshot {
        let inner = self.inner.read();
        BookSnapshot {
            window_id: inner.window_id.clone(),
            odds: inner.odds,
            up: inner.up,
            down: inner.down,
        }
    }
}

impl LivePriceSource for OddsBook {
    fn buy_price(&self, token_id: &str) -> Option<Decimal> {
        let inner = self.inner.read();
        let side = inner.side_of(token_id)?;
        inner.quote(side).best_ask.or_else(|| inner.odds.get(side))
    }

    fn sell_price(&self, token_id: &str) -> Option<Decimal> {
        let inner = self.inner.read();
        let side = inner.side_of(token_id)?;
        inner.quote(side).best_bid.or_else(|| inner.odds.get(side))
    }
}
