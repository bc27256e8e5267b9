pub mod crypto_price;
pub mod gamma;
pub mod odds_book;
pub mod paper_exchange;
pub mod polymarket_ws;
pub mod reference_ws;
mod ws_connect;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::domain::Side;

pub use crypto_price::CryptoPriceClient;
pub use gamma::{GammaClient, GammaEvent, GammaMarket};
pub use odds_book::{BookSnapshot, OddsBook};
pub use paper_exchange::PaperExchange;
pub use polymarket_ws::{OddsFeed, OddsSubscription};
pub use reference_ws::{ReferencePrice, ReferencePriceFeed, ReferenceTick};

/// Which live stream a status change refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Reference,
    Odds,
}

/// Message published by a feed task into the engine's queue
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// A new positive reference price was stored
    Reference { price: Decimal, at: DateTime<Utc> },
    /// The odds book changed for `window_id`
    Odds { window_id: String, side: Side },
    Status { feed: FeedKind, connected: bool },
}
