//! Outward-facing engine streams: a broadcast of discrete events and a
//! `watch` channel holding the latest per-tick snapshot.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::adapters::FeedKind;
use crate::domain::{AttemptOutcome, CycleState, OrderSide, Position, Quote, Side, StrategyKind};
use crate::strategy::risk::StopReason;
use crate::strategy::trade_logger::SessionTotals;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    CycleTransition {
        from: CycleState,
        to: CycleState,
        reason: String,
    },
    WindowOpened {
        window_id: String,
        title: String,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    },
    PriceToBeat {
        window_id: String,
        price: Option<Decimal>,
    },
    WindowClosed {
        window_id: String,
        open_positions: usize,
    },
    CheckpointConsumed {
        window_id: String,
        index: usize,
        threshold_secs: f64,
        fired: bool,
        reason: String,
    },
    Signal {
        window_id: String,
        strategy: StrategyKind,
        side: Side,
        reason: String,
    },
    OrderAttempt {
        window_id: String,
        order_side: OrderSide,
        side: Side,
        attempt: u8,
        target_price: Option<Decimal>,
        outcome: AttemptOutcome,
    },
    Filled {
        window_id: String,
        position: Position,
    },
    EntryFailed {
        window_id: String,
        strategy: StrategyKind,
        side: Side,
        reason: String,
    },
    StopLossTriggered {
        window_id: String,
        position_id: String,
        reasons: Vec<StopReason>,
    },
    StopLossFailed {
        window_id: String,
        position_id: String,
        reason: String,
    },
    LossReport {
        window_id: String,
        position_id: String,
        side: Side,
        strategy: StrategyKind,
        entry_price: Decimal,
        exit_price: Decimal,
        shares: Decimal,
        pnl: Decimal,
    },
    Settlement {
        window_id: String,
        winner: Option<Side>,
        pnl: Decimal,
    },
    FeedStatus {
        feed: FeedKind,
        connected: bool,
    },
}

/// Broadcast handle for engine events; sending never blocks or fails
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

/// Per-tick state for presentation layers and recorders
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub at: DateTime<Utc>,
    pub state: CycleState,
    pub window_id: Option<String>,
    pub title: Option<String>,
    pub seconds_remaining: Option<f64>,
    pub price_to_beat: Option<Decimal>,
    pub reference_price: Option<Decimal>,
    pub odds_up: Option<Decimal>,
    pub odds_down: Option<Decimal>,
    /// Model-implied P(UP) from the reference deviation
    pub implied_up: Option<f64>,
    pub up_quote: Quote,
    pub down_quote: Quote,
    pub last_signal: Option<String>,
    pub positions: Vec<Position>,
    pub in_flight: bool,
    pub totals: SessionTotals,
}

impl EngineSnapshot {
    pub fn idle(state: CycleState) -> Self {
        Self {
            at: Utc::now(),
            state,
            window_id: None,
            title: None,
            seconds_remaining: None,
            price_to_beat: None,
            reference_price: None,
            odds_up: None,
            odds_down: None,
            implied_up: None,
            up_quote: Quote::default(),
            down_quote: Quote::default(),
            last_signal: None,
            positions: Vec::new(),
            in_flight: false,
            totals: SessionTotals::default(),
        }
    }

    /// One-line human summary
    pub fn status_line(&self) -> String {
        let fmt = |v: Option<Decimal>| v.map(|d| d.to_string()).unwrap_or_else(|| "-".into());
        format!(
            "[{}] {} | {:.0}s left | ref={} beat={} | up={} down={} | positions={} in_flight={} | entries={} exits={} pnl={}",
            self.state,
            self.window_id.as_deref().unwrap_or("-"),
            self.seconds_remaining.unwrap_or(0.0),
            fmt(self.reference_price),
            fmt(self.price_to_beat),
            fmt(self.odds_up),
            fmt(self.odds_down),
            self.positions.len(),
            self.in_flight,
            self.totals.entries,
            self.totals.exits,
            self.totals.realized_pnl,
        )
    }
}

pub type SnapshotSender = watch::Sender<EngineSnapshot>;
pub type SnapshotReceiver = watch::Receiver<EngineSnapshot>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = EventBus::new();
        bus.emit(EngineEvent::FeedStatus {
            feed: FeedKind::Odds,
            connected: true,
        });

        let mut rx = bus.subscribe();
        bus.emit(EngineEvent::PriceToBeat {
            window_id: "w".into(),
            price: None,
        });
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::PriceToBeat { .. }
        ));
    }

    #[test]
    fn test_event_json_is_tagged() {
        let json = serde_json::to_value(EngineEvent::WindowClosed {
            window_id: "w".into(),
            open_positions: 1,
        })
        .unwrap();
        assert_eq!(json["type"], "window_closed");
        assert_eq!(json["open_positions"], 1);
    }

    #[test]
    fn test_idle_status_line() {
        let line = EngineSnapshot::idle(CycleState::Seeking).status_line();
        assert!(line.starts_with("[SEEKING] -"));
    }
}
