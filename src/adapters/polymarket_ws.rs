//! Market odds stream for the active window.
//!
//! Subscribes to exactly the two tokens of the current window on the CLOB
//! market channel and writes every update into the shared [`OddsBook`]. The
//! subscription follows a `watch` channel owned by the engine: a new window
//! means a fresh connection for the new token pair.

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::ws_connect::{connect_websocket, FeedHealth};
use super::{FeedEvent, FeedKind, OddsBook};
use crate::config::FeedsConfig;
use crate::error::{Result, UpDownError};

/// Token pair the feed should be subscribed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OddsSubscription {
    pub window_id: String,
    pub up_token_id: String,
    pub down_token_id: String,
    pub end_time: DateTime<Utc>,
}

impl OddsSubscription {
    pub fn seconds_remaining_at(&self, now: DateTime<Utc>) -> f64 {
        ((self.end_time - now).num_milliseconds() as f64 / 1000.0).max(0.0)
    }
}

/// Order book message from WebSocket
#[derive(Debug, Clone, Deserialize)]
struct BookMessage {
    asset_id: String,
    #[serde(default)]
    bids: Vec<PriceLevel>,
    #[serde(default)]
    asks: Vec<PriceLevel>,
}

#[derive(Debug, Clone, Deserialize)]
struct PriceLevel {
    price: String,
}

/// Price change message from WebSocket
#[derive(Debug, Clone, Deserialize)]
struct PriceChangesMessage {
    price_changes: Vec<PriceChangeItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct PriceChangeItem {
    asset_id: String,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    best_bid: Option<String>,
    #[serde(default)]
    best_ask: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LastTradeMessage {
    event_type: String,
    asset_id: String,
    price: String,
}

/// Initial subscription request
#[derive(Debug, Clone, Serialize)]
struct SubscribeRequest {
    #[serde(rename = "type")]
    msg_type: &'static str,
    assets_ids: Vec<String>,
}

/// One decoded odds update
#[derive(Debug, Clone, PartialEq)]
enum OddsUpdate {
    Top {
        token_id: String,
        best_bid: Option<Decimal>,
        best_ask: Option<Decimal>,
    },
    LastTrade {
        token_id: String,
        price: Decimal,
    },
}

fn parse_decimal(raw: Option<&str>) -> Option<Decimal> {
    raw?.parse::<Decimal>().ok()
}

fn book_top(book: &BookMessage) -> OddsUpdate {
    // No ordering assumed: best bid is the max, best ask the min
    let prices = |levels: &[PriceLevel]| {
        levels
            .iter()
            .filter_map(|l| l.price.parse::<Decimal>().ok())
            .collect::<Vec<_>>()
    };
    OddsUpdate::Top {
        token_id: book.asset_id.clone(),
        best_bid: prices(&book.bids).into_iter().max(),
        best_ask: prices(&book.asks).into_iter().min(),
    }
}

/// Decode a text frame. Unknown shapes decode to nothing.
fn parse_updates(text: &str) -> Vec<OddsUpdate> {
    if let Ok(books) = serde_json::from_str::<Vec<BookMessage>>(text) {
        return books.iter().map(book_top).collect();
    }

    if let Ok(msg) = serde_json::from_str::<PriceChangesMessage>(text) {
        return msg
            .price_changes
            .into_iter()
            .filter_map(|change| {
                let bid = parse_decimal(change.best_bid.as_deref());
                let ask = parse_decimal(change.best_ask.as_deref());
                // Older frames only carry the touched price
                let (best_bid, best_ask) = match (bid, ask) {
                    (None, None) => {
                        let price = parse_decimal(change.price.as_deref())?;
                        (Some(price), Some(price))
                    }
                    other => other,
                };
                Some(OddsUpdate::Top {
                    token_id: change.asset_id,
                    best_bid,
                    best_ask,
                })
            })
            .collect();
    }

    if let Ok(trade) = serde_json::from_str::<LastTradeMessage>(text) {
        if trade.event_type == "last_trade_price" {
            return trade
                .price
                .parse::<Decimal>()
                .ok()
                .map(|price| OddsUpdate::LastTrade {
                    token_id: trade.asset_id,
                    price,
                })
                .into_iter()
                .collect();
        }
    }

    if let Ok(book) = serde_json::from_str::<BookMessage>(text) {
        return vec![book_top(&book)];
    }

    Vec::new()
}

/// Why a streaming session ended
enum SessionEnd {
    /// Socket closed or failed
    Disconnected,
    /// Engine moved to another window
    Resubscribe,
    /// Engine is gone
    Shutdown,
}

/// Odds WebSocket client for the active window
pub struct OddsFeed {
    ws_url: String,
    reconnect_delay: Duration,
    min_reconnect_remaining_secs: f64,
    ping_interval: Duration,
    health_interval: Duration,
    stale_timeout: Duration,
    book: OddsBook,
    events: mpsc::Sender<FeedEvent>,
}

impl OddsFeed {
    pub fn new(
        ws_url: impl Into<String>,
        config: &FeedsConfig,
        book: OddsBook,
        events: mpsc::Sender<FeedEvent>,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            reconnect_delay: Duration::from_secs(config.odds_reconnect_secs),
            min_reconnect_remaining_secs: config.odds_reconnect_min_remaining_secs as f64,
            ping_interval: Duration::from_secs(config.ping_interval_secs.max(1)),
            health_interval: Duration::from_secs(config.health_check_secs.max(1)),
            stale_timeout: Duration::from_secs(config.stale_timeout_secs),
            book,
            events,
        }
    }

    /// Follow the engine's subscription until the engine goes away
    pub async fn run(
        self,
        mut subscription: watch::Receiver<Option<OddsSubscription>>,
    ) -> Result<()> {
        loop {
            let current = subscription.borrow_and_update().clone();
            let Some(sub) = current else {
                if subscription.changed().await.is_err() {
                    return Ok(());
                }
                continue;
            };

            let end = match self.connect_and_stream(&sub, &mut subscription).await {
                Ok(end) => end,
                Err(e) => {
                    warn!("Odds feed error for {}: {}", sub.window_id, e);
                    SessionEnd::Disconnected
                }
            };

            match end {
                SessionEnd::Shutdown => return Ok(()),
                SessionEnd::Resubscribe => continue,
                SessionEnd::Disconnected => {
                    self.notify(FeedEvent::Status {
                        feed: FeedKind::Odds,
                        connected: false,
                    });

                    let remaining = sub.seconds_remaining_at(Utc::now());
                    if remaining > self.min_reconnect_remaining_secs {
                        debug!(
                            "Reconnecting odds feed in {:?} ({:.1}s left)",
                            self.reconnect_delay, remaining
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(self.reconnect_delay) => {}
                            changed = subscription.changed() => {
                                if changed.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                    } else {
                        info!(
                            "Odds feed for {} closed with {:.1}s left; waiting for next window",
                            sub.window_id, remaining
                        );
                        if subscription.changed().await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn notify(&self, event: FeedEvent) {
        let _ = self.events.try_send(event);
    }

    /// Connect, subscribe to the window's two tokens, and stream updates
    async fn connect_and_stream(
        &self,
        sub: &OddsSubscription,
        subscription: &mut watch::Receiver<Option<OddsSubscription>>,
    ) -> Result<SessionEnd> {
        let url = Url::parse(&self.ws_url)
            .map_err(|e| UpDownError::Internal(format!("Invalid WebSocket URL: {}", e)))?;

        info!("Connecting odds feed for {}", sub.window_id);
        let ws_stream = connect_websocket(&url).await?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe_msg = SubscribeRequest {
            msg_type: "MARKET",
            assets_ids: vec![sub.up_token_id.clone(), sub.down_token_id.clone()],
        };
        write
            .send(Message::Text(serde_json::to_string(&subscribe_msg)?))
            .await?;
        info!("Subscribed odds feed to {}", sub.window_id);

        self.notify(FeedEvent::Status {
            feed: FeedKind::Odds,
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
                            if self.handle_message(&sub.window_id, &text) {
                                health.record_data();
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("Received close frame on odds feed");
                            return Ok(SessionEnd::Disconnected);
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(SessionEnd::Disconnected),
                        _ => {}
                    }
                }
                _ = ping_interval.tick() => {
                    write.send(Message::Ping(vec![])).await?;
                }
                _ = health_interval.tick() => health.check("odds")?,
                changed = subscription.changed() => {
                    if changed.is_err() {
                        return Ok(SessionEnd::Shutdown);
                    }
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Resubscribe);
                }
            }
        }
    }

    /// Apply a text frame to the book. Returns whether any side changed.
    fn handle_message(&self, window_id: &str, text: &str) -> bool {
        let now = Utc::now();
        let mut applied = false;
        for update in parse_updates(text) {
            let side = match &update {
                OddsUpdate::Top {
                    token_id,
                    best_bid,
                    best_ask,
                } => self.book.apply_top(token_id, *best_bid, *best_ask, now),
                OddsUpdate::LastTrade { token_id, price } => {
                    self.book.apply_probability(token_id, *price, now)
                }
            };

            if let Some(side) = side {
                applied = true;
                debug!("Odds update {}: {:?}", side, update);
                self.notify(FeedEvent::Odds {
                    window_id: window_id.to_string(),
                    side,
                });
            }
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_book_snapshot_unordered() {
        let text = r#"[{"event_type":"book","asset_id":"up","market":"m",
            "bids":[{"price":"0.40","size":"10"},{"price":"0.45","size":"5"}],
            "asks":[{"price":"0.52","size":"3"},{"price":"0.48","size":"7"}]}]"#;
        assert_eq!(
            parse_updates(text),
            vec![OddsUpdate::Top {
                token_id: "up".into(),
                best_bid: Some(dec!(0.45)),
                best_ask: Some(dec!(0.48)),
            }]
        );
    }

    #[test]
    fn test_parse_price_change_with_top() {
        let text = r#"{"market":"m","event_type":"price_change","price_changes":[
            {"asset_id":"down","price":"0.30","size":"1","side":"BUY","best_bid":"0.31","best_ask":"0.33"}]}"#;
        assert_eq!(
            parse_updates(text),
            vec![OddsUpdate::Top {
                token_id: "down".into(),
                best_bid: Some(dec!(0.31)),
                best_ask: Some(dec!(0.33)),
            }]
        );
    }

    #[test]
    fn test_parse_price_change_price_only() {
        let text = r#"{"market":"m","price_changes":[{"asset_id":"up","price":"0.61"}]}"#;
        assert_eq!(
            parse_updates(text),
            vec![OddsUpdate::Top {
                token_id: "up".into(),
                best_bid: Some(dec!(0.61)),
                best_ask: Some(dec!(0.61)),
            }]
        );
    }

    #[test]
    fn test_parse_last_trade() {
        let text = r#"{"event_type":"last_trade_price","asset_id":"up","market":"m","price":"0.57","side":"BUY","size":"10"}"#;
        assert_eq!(
            parse_updates(text),
            vec![OddsUpdate::LastTrade {
                token_id: "up".into(),
                price: dec!(0.57),
            }]
        );
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_updates("PONG").is_empty());
        assert!(parse_updates(r#"{"hello":"world"}"#).is_empty());
    }

    #[test]
    fn test_handle_message_updates_book_and_notifies() {
        let now = Utc::now();
        let window = crate::domain::MarketWindow::new(
            "w1",
            "t",
            "up",
            "down",
            now,
            now + chrono::Duration::minutes(15),
        );
        let book = OddsBook::new();
        book.reset(&window);

        let (tx, mut rx) = mpsc::channel(8);
        let feed = OddsFeed::new("wss://x", &FeedsConfig::default(), book.clone(), tx);

        assert!(feed.handle_message(
            "w1",
            r#"{"event_type":"last_trade_price","asset_id":"down","price":"0.25"}"#,
        ));

        assert_eq!(book.odds().up, Some(dec!(0.75)));
        match rx.try_recv().unwrap() {
            FeedEvent::Odds { window_id, side } => {
                assert_eq!(window_id, "w1");
                assert_eq!(side, crate::domain::Side::Down);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_frames_without_updates_do_not_count_as_data() {
        let (tx, mut rx) = mpsc::channel(8);
        let feed = OddsFeed::new("wss://x", &FeedsConfig::default(), OddsBook::new(), tx);

        assert!(!feed.handle_message("w1", "PONG"));
        assert!(!feed.handle_message("w1", r#"{"hello":"world"}"#));
        assert!(rx.try_recv().is_err());
    }
}
