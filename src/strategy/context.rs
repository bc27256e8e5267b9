//! Per-window state owned by the engine loop and replaced wholesale at rollover.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::{FeedsConfig, StrategyConfig};
use crate::domain::{MarketWindow, Position, Side, StrategyKind};
use crate::error::Result;
use crate::strategy::checkpoint::CheckpointLadder;
use crate::strategy::history::OddsHistory;

/// The one order sequence allowed to run at a time
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InFlight {
    Entry {
        strategy: StrategyKind,
        side: Side,
        started_at: DateTime<Utc>,
    },
    Exit {
        position_id: String,
        started_at: DateTime<Utc>,
    },
}

/// Lifecycle of the passive resting bids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PassivePhase {
    #[default]
    Pending,
    Resting,
    Done,
}

#[derive(Debug)]
pub struct WindowContext {
    pub window: MarketWindow,
    pub ladder: CheckpointLadder,
    pub history: OddsHistory,
    pub positions: Vec<Position>,
    in_flight: Option<InFlight>,
    pub early_entry_fired: bool,
    pub last_resort_fired: bool,
    pub stop_loss_fired: bool,
    /// Confirmed entry fills this window
    pub entries: u32,
    pub last_arb_entry_at: Option<DateTime<Utc>>,
    pub passive: PassivePhase,
    pub last_signal: Option<String>,
    pub realized_pnl: Decimal,
}

impl WindowContext {
    pub fn new(
        window: MarketWindow,
        strategy: &StrategyConfig,
        feeds: &FeedsConfig,
    ) -> Result<Self> {
        let ladder = CheckpointLadder::new(
            &strategy.checkpoints.levels,
            strategy.checkpoints.floor_secs,
        )?;

        Ok(Self {
            window,
            ladder,
            history: OddsHistory::new(feeds.history_capacity),
            positions: Vec::new(),
            in_flight: None,
            early_entry_fired: false,
            last_resort_fired: false,
            stop_loss_fired: false,
            entries: 0,
            last_arb_entry_at: None,
            passive: if strategy.passive.enabled {
                PassivePhase::Pending
            } else {
                PassivePhase::Done
            },
            last_signal: None,
            realized_pnl: Decimal::ZERO,
        })
    }

    pub fn id(&self) -> &str {
        &self.window.id
    }

    pub fn seconds_remaining_at(&self, now: DateTime<Utc>) -> f64 {
        self.window.seconds_remaining_at(now)
    }

    pub fn in_flight(&self) -> Option<&InFlight> {
        self.in_flight.as_ref()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Claim the in-flight slot. Returns false if something already holds it.
    pub fn try_begin(&mut self, flight: InFlight) -> bool {
        if self.in_flight.is_some() {
            return false;
        }
        self.in_flight = Some(flight);
        true
    }

    pub fn finish_flight(&mut self) {
        self.in_flight = None;
    }

    pub fn position_on(&self, side: Side) -> Option<&Position> {
        self.positions.iter().find(|p| p.side == side)
    }

    pub fn has_position(&self) -> bool {
        !self.positions.is_empty()
    }

    pub fn add_position(&mut self, position: Position) {
        self.entries += 1;
        self.positions.push(position);
    }

    pub fn remove_position(&mut self, position_id: &str) -> Option<Position> {
        let idx = self.positions.iter().position(|p| p.id == position_id)?;
        Some(self.positions.remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn ctx() -> WindowContext {
        let now = Utc::now();
        let window = MarketWindow::new("w", "t", "up", "down", now, now + Duration::minutes(15));
        WindowContext::new(window, &StrategyConfig::default(), &FeedsConfig::default()).unwrap()
    }

    #[test]
    fn test_in_flight_guard() {
        let mut c = ctx();
        let entry = InFlight::Entry {
            strategy: StrategyKind::Checkpoint,
            side: Side::Up,
            started_at: Utc::now(),
        };
        assert!(c.try_begin(entry.clone()));
        assert!(!c.try_begin(InFlight::Exit {
            position_id: "p".into(),
            started_at: Utc::now(),
        }));
        assert_eq!(c.in_flight(), Some(&entry));

        c.finish_flight();
        assert!(!c.is_in_flight());
    }

    #[test]
    fn test_positions() {
        let mut c = ctx();
        let p = Position::new(
            "w",
            Side::Down,
            "down",
            dec!(0.6),
            dec!(8),
            StrategyKind::LastResort,
        );
        let id = p.id.clone();
        c.add_position(p);
        assert_eq!(c.entries, 1);
        assert!(c.position_on(Side::Down).is_some());
        assert!(c.position_on(Side::Up).is_none());

        assert!(c.remove_position(&id).is_some());
        assert!(!c.has_position());
        // Entries count survives the exit
        assert_eq!(c.entries, 1);
    }

    #[test]
    fn test_fresh_context_defaults() {
        let c = ctx();
        assert_eq!(c.ladder.len(), 4);
        assert_eq!(c.history.capacity(), 30);
        assert_eq!(c.passive, PassivePhase::Done);
    }
}
