//! Reference asset price stream.
//!
//! Two sources are supported: Chainlink oracle prices over Polymarket's RTDS
//! WebSocket, and Binance aggregated trades. Either way the connection lives
//! for the whole session and reconnects after a fixed delay, re-issuing its
//! subscription on every connect.

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::ws_connect::{connect_websocket, FeedHealth};
use super::{FeedEvent, FeedKind};
use crate::config::{FeedsConfig, ReferenceSource};
use crate::error::{Result, UpDownError};

/// Latest reference price
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReferenceTick {
    pub price: Decimal,
    pub at: DateTime<Utc>,
}

/// Shared cell holding the most recent reference price
#[derive(Debug, Clone, Default)]
pub struct ReferencePrice {
    inner: Arc<RwLock<Option<ReferenceTick>>>,
}

impl ReferencePrice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `price` if it is positive. Returns whether it was stored.
    pub fn update(&self, price: Decimal, at: DateTime<Utc>) -> bool {
        if price <= Decimal::ZERO {
            return false;
        }
        *self.inner.write() = Some(ReferenceTick { price, at });
        true
    }

    pub fn latest(&self) -> Option<ReferenceTick> {
        *self.inner.read()
    }

    pub fn price(&self) -> Option<Decimal> {
        self.latest().map(|t| t.price)
    }
}

// ---------------------------------------------------------------------------
// Wire protocol types
// ---------------------------------------------------------------------------

/// Subscribe message sent to the RTDS WebSocket
#[derive(Debug, Serialize)]
struct RtdsSubscribe {
    action: &'static str,
    subscriptions: Vec<RtdsSubscription>,
}

#[derive(Debug, Serialize)]
struct RtdsSubscription {
    topic: &'static str,
    #[serde(rename = "type")]
    sub_type: &'static str,
    filters: String,
}

/// RTDS envelope; the price sits in `payload`
#[derive(Debug, Deserialize)]
struct RtdsMessage {
    payload: RtdsPayload,
}

#[derive(Debug, Deserialize)]
struct RtdsPayload {
    symbol: String,
    timestamp: i64,
    value: f64,
}

/// Binance aggTrade event
#[derive(Debug, Deserialize)]
struct BinanceAggTrade {
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "T")]
    trade_time: i64,
}

/// Decode one text frame into a price sample. Anything malformed is `None`.
fn parse_price(
    source: ReferenceSource,
    symbol: &str,
    text: &str,
) -> Option<(Decimal, DateTime<Utc>)> {
    let (price, ts_ms) = match source {
        ReferenceSource::Chainlink => {
            // Enveloped updates first, bare payloads as a fallback
            let payload = match serde_json::from_str::<RtdsMessage>(text) {
                Ok(msg) => msg.payload,
                Err(_) => serde_json::from_str::<RtdsPayload>(text).ok()?,
            };
            if !payload.symbol.eq_ignore_ascii_case(symbol) || !payload.value.is_finite() {
                return None;
            }
            (Decimal::try_from(payload.value).ok()?, payload.timestamp)
        }
        ReferenceSource::Binance => {
            let trade: BinanceAggTrade = serde_json::from_str(text).ok()?;
            (trade.price.parse::<Decimal>().ok()?, trade.trade_time)
        }
    };

    if price <= Decimal::ZERO {
        return None;
    }
    let at = DateTime::from_timestamp_millis(ts_ms).unwrap_or_else(Utc::now);
    Some((price, at))
}

// ---------------------------------------------------------------------------
// Main client
// ---------------------------------------------------------------------------

/// Reference price WebSocket client
pub struct ReferencePriceFeed {
    source: ReferenceSource,
    symbol: String,
    url: String,
    reconnect_delay: Duration,
    ping_interval: Duration,
    health_interval: Duration,
    stale_timeout: Duration,
    price: ReferencePrice,
    events: mpsc::Sender<FeedEvent>,
}

impl ReferencePriceFeed {
    pub fn new(
        config: &FeedsConfig,
        price: ReferencePrice,
        events: mpsc::Sender<FeedEvent>,
    ) -> Self {
        let (symbol, url) = match config.reference_source {
            ReferenceSource::Chainlink => {
                (config.chainlink_symbol.to_ascii_lowercase(), config.rtds_url.clone())
            }
            ReferenceSource::Binance => {
                let symbol = config.binance_symbol.to_ascii_lowercase();
                let url = format!(
                    "{}/{}@aggTrade",
                    config.binance_ws_url.trim_end_matches('/'),
                    symbol
                );
                (symbol, url)
            }
        };

        Self {
            source: config.reference_source,
            symbol,
            url,
            reconnect_delay: Duration::from_secs(config.reference_reconnect_secs),
            ping_interval: Duration::from_secs(config.ping_interval_secs.max(1)),
            health_interval: Duration::from_secs(config.health_check_secs.max(1)),
            stale_timeout: Duration::from_secs(config.stale_timeout_secs),
            price,
            events,
        }
    }

    pub fn price(&self) -> &ReferencePrice {
        &self.price
    }

    /// Run forever, reconnecting after a fixed delay. Returns only when the
    /// engine side of the event channel has gone away.
    pub async fn run(&self) -> Result<()> {
        info!(
            "Starting reference price feed ({:?} {})",
            self.source, self.symbol
        );

        loop {
            match self.connect_and_stream().await {
                Ok(()) => info!("Reference feed connection closed"),
                Err(e) => warn!("Reference feed error: {}", e),
            }

            let disconnected = FeedEvent::Status {
                feed: FeedKind::Reference,
                connected: false,
            };
            if self.notify(disconnected).is_err() {
                return Ok(());
            }

            debug!("Reconnecting reference feed in {:?}", self.reconnect_delay);
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    fn notify(&self, event: FeedEvent) -> std::result::Result<(), ()> {
        match self.events.try_send(event) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(()),
        }
    }

    /// Connect, subscribe, and stream price data
    async fn connect_and_stream(&self) -> Result<()> {
        let url = Url::parse(&self.url)
            .map_err(|e| UpDownError::Internal(format!("Invalid reference feed URL: {}", e)))?;

        info!("Connecting to reference feed: {}", url);
        let ws_stream = connect_websocket(&url).await?;
        let (mut write, mut read) = ws_stream.split();

        if self.source == ReferenceSource::Chainlink {
            let msg = RtdsSubscribe {
                action: "subscribe",
                subscriptions: vec![RtdsSubscription {
                    topic: "crypto_prices_chainlink",
                    sub_type: "*",
                    filters: format!(r#"{{"symbol":"{}"}}"#, self.symbol),
                }],
            };
            write.send(Message::Text(serde_json::to_string(&msg)?)).await?;
            info!("Subscribed to Chainlink RTDS: {}", self.symbol);
        }

        let _ = self.notify(FeedEvent::Status {
            feed: FeedKind::Reference,
            connected: true,
        });

        let mut ping_interval = interval(self.ping_interval);
        let mut health_interval = interval(self.health_interval);
        let mut health = FeedHealth::new(self.stale_timeout);

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if self.handle_message(&text) {
                                health.record_data();
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("Received close frame from reference feed");
                            break;
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => break,
                        _ => {}
                    }
                }
                _ = ping_interval.tick() => {
                    write.send(Message::Ping(vec![])).await?;
                }
                _ = health_interval.tick() => health.check("reference")?,
            }
        }

        Ok(())
    }

    /// Store a decoded price sample. Returns whether one was stored.
    fn handle_message(&self, text: &str) -> bool {
        let Some((price, at)) = parse_price(self.source, &self.symbol, text) else {
            return false;
        };

        if !self.price.update(price, at) {
            return false;
        }
        let _ = self.notify(FeedEvent::Reference { price, at });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_rtds_payload() {
        let text = r#"{"topic":"crypto_prices_chainlink","type":"update","timestamp":1,
            "payload":{"symbol":"btc/usd","timestamp":1735689600000,"value":97123.45}}"#;
        let (price, at) = parse_price(ReferenceSource::Chainlink, "btc/usd", text).unwrap();
        assert_eq!(price, dec!(97123.45));
        assert_eq!(at.timestamp(), 1735689600);
    }

    #[test]
    fn test_parse_rtds_ignores_other_symbols() {
        let text = r#"{"payload":{"symbol":"eth/usd","timestamp":1,"value":3000.0}}"#;
        assert!(parse_price(ReferenceSource::Chainlink, "btc/usd", text).is_none());
    }

    #[test]
    fn test_parse_binance_agg_trade() {
        let text = r#"{"e":"aggTrade","E":1,"s":"BTCUSDT","a":1,"p":"97000.10","q":"0.01","T":1735689600000,"m":false}"#;
        let (price, _) = parse_price(ReferenceSource::Binance, "btcusdt", text).unwrap();
        assert_eq!(price, dec!(97000.10));
    }

    #[test]
    fn test_malformed_and_non_positive_dropped() {
        assert!(parse_price(ReferenceSource::Binance, "btcusdt", "not json").is_none());
        assert!(parse_price(ReferenceSource::Binance, "btcusdt", r#"{"p":"abc","T":1}"#).is_none());
        assert!(parse_price(ReferenceSource::Binance, "btcusdt", r#"{"p":"0","T":1}"#).is_none());
        let negative = r#"{"payload":{"symbol":"btc/usd","timestamp":1,"value":-5.0}}"#;
        assert!(parse_price(ReferenceSource::Chainlink, "btc/usd", negative).is_none());
    }

    #[test]
    fn test_reference_cell_rejects_non_positive() {
        let cell = ReferencePrice::new();
        assert!(!cell.update(Decimal::ZERO, Utc::now()));
        assert!(cell.price().is_none());
        assert!(cell.update(dec!(97000), Utc::now()));
        assert_eq!(cell.price(), Some(dec!(97000)));
    }

    #[test]
    fn test_binance_stream_url() {
        let config = FeedsConfig {
            reference_source: ReferenceSource::Binance,
            ..FeedsConfig::default()
        };
        let (tx, _rx) = mpsc::channel(4);
        let feed = ReferencePriceFeed::new(&config, ReferencePrice::new(), tx);
        assert_eq!(feed.url, "wss://stream.binance.com:9443/ws/btcusdt@aggTrade");
    }
}
