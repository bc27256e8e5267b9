//! Trade and session logging
//!
//! Appends one JSON object per line to the configured file:
//! - session start / stop markers
//! - one trade record per attempt sequence (entry or stop-loss exit)
//! - estimated settlement of positions still open at rollover
//!
//! Session totals are kept in memory for the engine snapshot.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::TradeLogConfig;
use crate::domain::{OrderSide, Side, StrategyKind, TradeAttempt};
use crate::error::Result;
use crate::strategy::executor::ExecutionReport;
use crate::strategy::passive::PassiveFill;

/// Running totals for the current process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionTotals {
    pub entries: u32,
    pub exits: u32,
    pub failed_sequences: u32,
    pub settlements: u32,
    pub realized_pnl: Decimal,
}

/// One entry or exit attempt sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeHistoryRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub window_id: String,
    pub order_side: OrderSide,
    pub side: Side,
    pub strategy: StrategyKind,
    pub token_id: String,
    pub cutoff_secs: f64,
    pub attempts: Vec<TradeAttempt>,
    pub filled: bool,
    pub fill_price: Option<Decimal>,
    pub shares: Option<Decimal>,
    /// Realized PnL, for exits
    pub pnl: Option<Decimal>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl TradeHistoryRecord {
    pub fn from_report(report: &ExecutionReport, pnl: Option<Decimal>) -> Self {
        let plan = &report.plan;
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: report.finished_at,
            window_id: plan.window_id.clone(),
            order_side: plan.order_side(),
            side: plan.side,
            strategy: plan.strategy,
            token_id: plan.token_id.clone(),
            cutoff_secs: plan.cutoff_secs,
            attempts: report.attempts.clone(),
            filled: report.is_filled(),
            fill_price: report.fill.map(|f| f.price),
            shares: report.fill.map(|f| f.shares),
            pnl,
            error: report.error.as_ref().map(ToString::to_string),
            started_at: report.started_at,
        }
    }

    /// A resting bid that filled; it has no attempt sequence of its own
    pub fn from_passive_fill(fill: &PassiveFill) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now,
            window_id: fill.window_id.clone(),
            order_side: OrderSide::Buy,
            side: fill.side,
            strategy: StrategyKind::PassiveResting,
            token_id: fill.token_id.clone(),
            cutoff_secs: 0.0,
            attempts: Vec::new(),
            filled: true,
            fill_price: Some(fill.price),
            shares: Some(fill.shares),
            pnl: None,
            error: None,
            started_at: now,
        }
    }
}

/// Estimated outcome of one window's open positions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub timestamp: DateTime<Utc>,
    pub window_id: String,
    pub price_to_beat: Option<Decimal>,
    pub final_reference: Option<Decimal>,
    /// `None` when either price is unknown
    pub winner: Option<Side>,
    pub positions: usize,
    pub pnl: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LogRecord {
    SessionStart {
        timestamp: DateTime<Utc>,
        mode: String,
        dry_run: bool,
    },
    Trade(TradeHistoryRecord),
    Settlement(SettlementRecord),
    SessionStop {
        timestamp: DateTime<Utc>,
        totals: SessionTotals,
    },
}

/// Append-only JSON-lines logger
#[derive(Debug)]
pub struct TradeLogger {
    path: Option<PathBuf>,
    totals: Mutex<SessionTotals>,
}

impl TradeLogger {
    pub fn new(config: &TradeLogConfig) -> Self {
        Self {
            path: config.enabled.then(|| config.path.clone()),
            totals: Mutex::new(SessionTotals::default()),
        }
    }

    /// Logger that only keeps totals
    pub fn disabled() -> Self {
        Self {
            path: None,
            totals: Mutex::new(SessionTotals::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn totals(&self) -> SessionTotals {
        self.totals.lock().clone()
    }

    pub async fn append(&self, record: &LogRecord) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!("Appended record to {:?}", path);
        Ok(())
    }

    pub async fn session_start(&self, mode: &str, dry_run: bool) -> Result<()> {
        self.append(&LogRecord::SessionStart {
            timestamp: Utc::now(),
            mode: mode.to_string(),
            dry_run,
        })
        .await
    }

    pub async fn session_stop(&self) -> Result<()> {
        let totals = self.totals();
        self.append(&LogRecord::SessionStop {
            timestamp: Utc::now(),
            totals,
        })
        .await
    }

    /// Record an attempt sequence and fold it into the totals
    pub async fn record_execution(
        &self,
        report: &ExecutionReport,
        pnl: Option<Decimal>,
    ) -> Result<()> {
        let record = TradeHistoryRecord::from_report(report, pnl);
        {
            let mut totals = self.totals.lock();
            match (record.filled, record.order_side) {
                (true, OrderSide::Buy) => totals.entries += 1,
                (true, OrderSide::Sell) => totals.exits += 1,
                (false, _) => totals.failed_sequences += 1,
            }
            if let Some(pnl) = record.pnl {
                totals.realized_pnl += pnl;
            }
        }
        self.append(&LogRecord::Trade(record)).await
    }

    /// Record a fill that did not come from the retry engine (resting orders)
    pub async fn record_passive_fill(&self, fill: &PassiveFill) -> Result<()> {
        self.totals.lock().entries += 1;
        self.append(&LogRecord::Trade(TradeHistoryRecord::from_passive_fill(fill)))
            .await
    }

    pub async fn record_settlement(&self, settlement: SettlementRecord) -> Result<()> {
        {
            let mut totals = self.totals.lock();
            totals.settlements += 1;
            totals.realized_pnl += settlement.pnl;
        }
        self.append(&LogRecord::Settlement(settlement)).await
    }
}

/// Read every record back from a log file
pub async fn read_log(path: &Path) -> Result<Vec<LogRecord>> {
    let content = tokio::fs::read_to_string(path).await?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AttemptOutcome;
    use crate::error::OrderError;
    use crate::strategy::executor::{Fill, OrderPlan};
    use rust_decimal_macros::dec;
    use tokio::time::Instant;

    fn report(filled: bool) -> ExecutionReport {
        let plan = OrderPlan::entry(
            "btc-updown-15m-1",
            Side::Up,
            "up",
            StrategyKind::Checkpoint,
            dec!(5),
            Instant::now(),
            22.0,
        );
        ExecutionReport {
            plan,
            attempts: vec![TradeAttempt {
                attempt: 1,
                live_price: Some(dec!(0.9)),
                slippage: dec!(0.03),
                target_price: Some(dec!(0.93)),
                outcome: if filled {
                    AttemptOutcome::Filled {
                        price: dec!(0.93),
                        shares: dec!(5.37),
                    }
                } else {
                    AttemptOutcome::NotFilled
                },
                diagnostics: Vec::new(),
                at: Utc::now(),
            }],
            fill: filled.then_some(Fill {
                price: dec!(0.93),
                shares: dec!(5.37),
            }),
            error: (!filled).then_some(OrderError::MaxAttemptsExceeded { attempts: 1 }),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_jsonl_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("trades.jsonl");
        let logger = TradeLogger::new(&TradeLogConfig {
            enabled: true,
            path: path.clone(),
        });

        logger.session_start("single", true).await.unwrap();
        logger.record_execution(&report(true), None).await.unwrap();
        logger.record_execution(&report(false), None).await.unwrap();
        logger
            .record_settlement(SettlementRecord {
                timestamp: Utc::now(),
                window_id: "btc-updown-15m-1".into(),
                price_to_beat: Some(dec!(97000)),
                final_reference: Some(dec!(97050)),
                winner: Some(Side::Up),
                positions: 1,
                pnl: dec!(0.38),
            })
            .await
            .unwrap();
        logger.session_stop().await.unwrap();

        let records = read_log(&path).await.unwrap();
        assert_eq!(records.len(), 5);
        assert!(matches!(records[0], LogRecord::SessionStart { .. }));
        match &records[1] {
            LogRecord::Trade(trade) => {
                assert!(trade.filled);
                assert_eq!(trade.fill_price, Some(dec!(0.93)));
            }
            other => panic!("unexpected {:?}", other),
        }
        match &records[4] {
            LogRecord::SessionStop { totals, .. } => {
                assert_eq!(totals.entries, 1);
                assert_eq!(totals.failed_sequences, 1);
                assert_eq!(totals.realized_pnl, dec!(0.38));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_passive_fill_is_logged_as_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.jsonl");
        let logger = TradeLogger::new(&TradeLogConfig {
            enabled: true,
            path: path.clone(),
        });

        logger
            .record_passive_fill(&PassiveFill {
                window_id: "btc-updown-15m-1".into(),
                side: Side::Down,
                token_id: "down".into(),
                order_id: "paper-1".into(),
                price: dec!(0.45),
                shares: dec!(10),
            })
            .await
            .unwrap();

        assert_eq!(logger.totals().entries, 1);
        let records = read_log(&path).await.unwrap();
        assert_eq!(records.len(), 1);
        match &records[0] {
            LogRecord::Trade(trade) => {
                assert_eq!(trade.strategy, StrategyKind::PassiveResting);
                assert_eq!(trade.order_side, OrderSide::Buy);
                assert_eq!(trade.side, Side::Down);
                assert!(trade.filled);
                assert_eq!(trade.fill_price, Some(dec!(0.45)));
                assert_eq!(trade.shares, Some(dec!(10)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disabled_logger_keeps_totals() {
        let logger = TradeLogger::disabled();
        logger.record_execution(&report(true), None).await.unwrap();
        assert!(logger.path().is_none());
        assert_eq!(logger.totals().entries, 1);
    }
}
