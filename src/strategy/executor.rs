use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::ExecutionConfig;
use crate::domain::{
    AttemptOutcome, OrderRequest, OrderSide, OrderStatus, Position, Side, StrategyKind,
    TradeAttempt,
};
use crate::error::OrderError;
use crate::exchange::{ExchangeClient, LivePriceSource};
use crate::strategy::events::{EngineEvent, EventBus};

/// What an order sequence is trying to do
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderIntent {
    /// Buy with a fixed USD stake
    Enter { notional: Decimal },
    /// Sell an existing holding
    Exit { position_id: String, shares: Decimal },
}

/// One bounded attempt sequence for the retry engine
#[derive(Debug, Clone)]
pub struct OrderPlan {
    pub window_id: String,
    pub side: Side,
    pub token_id: String,
    pub strategy: StrategyKind,
    pub intent: OrderIntent,
    /// When the window closes
    pub deadline: Instant,
    /// Attempts stop once fewer than this many seconds remain
    pub cutoff_secs: f64,
}

impl OrderPlan {
    pub fn entry(
        window_id: impl Into<String>,
        side: Side,
        token_id: impl Into<String>,
        strategy: StrategyKind,
        notional: Decimal,
        deadline: Instant,
        cutoff_secs: f64,
    ) -> Self {
        Self {
            window_id: window_id.into(),
            side,
            token_id: token_id.into(),
            strategy,
            intent: OrderIntent::Enter { notional },
            deadline,
            cutoff_secs,
        }
    }

    /// Stop-loss exit of `position`; attempts continue until the window closes
    pub fn exit(position: &Position, deadline: Instant) -> Self {
        Self {
            window_id: position.window_id.clone(),
            side: position.side,
            token_id: position.token_id.clone(),
            strategy: position.strategy,
            intent: OrderIntent::Exit {
                position_id: position.id.clone(),
                shares: position.shares,
            },
            deadline,
            cutoff_secs: 0.0,
        }
    }

    pub fn order_side(&self) -> OrderSide {
        match self.intent {
            OrderIntent::Enter { .. } => OrderSide::Buy,
            OrderIntent::Exit { .. } => OrderSide::Sell,
        }
    }

    pub fn remaining_secs(&self) -> f64 {
        self.deadline
            .saturating_duration_since(Instant::now())
            .as_secs_f64()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Fill {
    pub price: Decimal,
    pub shares: Decimal,
}

/// Outcome of a whole attempt sequence
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub plan: OrderPlan,
    pub attempts: Vec<TradeAttempt>,
    pub fill: Option<Fill>,
    pub error: Option<OrderError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionReport {
    pub fn is_filled(&self) -> bool {
        self.fill.is_some()
    }

    /// Position created by a filled entry
    pub fn position(&self) -> Option<Position> {
        let fill = self.fill?;
        match self.plan.intent {
            OrderIntent::Enter { .. } => Some(Position::new(
                self.plan.window_id.clone(),
                self.plan.side,
                self.plan.token_id.clone(),
                fill.price,
                fill.shares,
                self.plan.strategy,
            )),
            OrderIntent::Exit { .. } => None,
        }
    }

    pub fn failure_reason(&self) -> String {
        match &self.error {
            Some(e) => e.to_string(),
            None if self.fill.is_some() => "filled".to_string(),
            None => "not filled".to_string(),
        }
    }
}

/// Retry engine shared by entries and stop-loss exits.
///
/// Every attempt re-reads the live price, adds the scheduled slippage and
/// submits a fill-or-kill order. The sequence ends on the first fill, when the
/// schedule is exhausted, or when the time cutoff is crossed.
#[derive(Clone)]
pub struct OrderExecutor {
    exchange: Arc<dyn ExchangeClient>,
    prices: Arc<dyn LivePriceSource>,
    config: ExecutionConfig,
    events: EventBus,
}

impl OrderExecutor {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        prices: Arc<dyn LivePriceSource>,
        config: ExecutionConfig,
        events: EventBus,
    ) -> Self {
        Self {
            exchange,
            prices,
            config,
            events,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.exchange.is_dry_run()
    }

    fn schedule(&self, order_side: OrderSide) -> (&[Decimal], Duration) {
        match order_side {
            OrderSide::Buy => (
                &self.config.entry_slippage,
                Duration::from_millis(self.config.entry_retry_delay_ms),
            ),
            OrderSide::Sell => (
                &self.config.exit_slippage,
                Duration::from_millis(self.config.exit_retry_delay_ms),
            ),
        }
    }

    fn target_price(&self, order_side: OrderSide, live: Decimal, slippage: Decimal) -> Decimal {
        match order_side {
            OrderSide::Buy => (live + slippage).min(self.config.max_price),
            OrderSide::Sell => (live - slippage).max(self.config.min_price),
        }
    }

    fn request_for(&self, plan: &OrderPlan, price: Decimal) -> OrderRequest {
        match &plan.intent {
            OrderIntent::Enter { notional } => {
                OrderRequest::buy_notional(plan.token_id.clone(), plan.side, *notional, price)
            }
            OrderIntent::Exit { shares, .. } => {
                OrderRequest::sell(plan.token_id.clone(), plan.side, *shares, price)
            }
        }
    }

    pub async fn execute(&self, plan: OrderPlan) -> ExecutionReport {
        let order_side = plan.order_side();
        let (slippage, delay) = self.schedule(order_side);
        let slippage = slippage.to_vec();
        let started_at = Utc::now();

        let mut attempts = Vec::with_capacity(slippage.len());
        let mut fill = None;
        let mut error = None;

        for (idx, step) in slippage.iter().copied().enumerate() {
            let attempt = (idx + 1) as u8;

            let remaining = plan.remaining_secs();
            if remaining < plan.cutoff_secs || remaining <= 0.0 {
                debug!(
                    window = %plan.window_id,
                    attempt,
                    "{} {} stopped at cutoff: {:.1}s left < {:.1}s",
                    order_side, plan.side, remaining, plan.cutoff_secs
                );
                error = Some(OrderError::CutoffReached {
                    remaining_secs: remaining,
                    cutoff_secs: plan.cutoff_secs,
                });
                break;
            }

            let live = match order_side {
                OrderSide::Buy => self.prices.buy_price(&plan.token_id),
                OrderSide::Sell => self.prices.sell_price(&plan.token_id),
            };

            let record = match live {
                Some(live) => self.attempt(&plan, attempt, live, step).await,
                None => {
                    let err = OrderError::NoLivePrice {
                        token_id: plan.token_id.clone(),
                    };
                    warn!(window = %plan.window_id, attempt, "{}", err);
                    TradeAttempt {
                        attempt,
                        live_price: None,
                        slippage: step,
                        target_price: None,
                        outcome: AttemptOutcome::Error {
                            message: err.to_string(),
                        },
                        diagnostics: Vec::new(),
                        at: Utc::now(),
                    }
                }
            };

            self.events.emit(EngineEvent::OrderAttempt {
                window_id: plan.window_id.clone(),
                order_side,
                side: plan.side,
                attempt,
                target_price: record.target_price,
                outcome: record.outcome.clone(),
            });

            if let AttemptOutcome::Filled { price, shares } = record.outcome {
                info!(
                    window = %plan.window_id,
                    side = %plan.side,
                    strategy = %plan.strategy,
                    price = %price,
                    attempt,
                    "{} filled: {} shares @ {}",
                    order_side, shares, price
                );
                fill = Some(Fill { price, shares });
                attempts.push(record);
                break;
            }
            attempts.push(record);

            if idx + 1 < slippage.len() {
                sleep(delay).await;
            }
        }

        if fill.is_none() && error.is_none() {
            error = Some(OrderError::MaxAttemptsExceeded {
                attempts: attempts.len() as u8,
            });
        }

        ExecutionReport {
            plan,
            attempts,
            fill,
            error,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn attempt(
        &self,
        plan: &OrderPlan,
        attempt: u8,
        live: Decimal,
        step: Decimal,
    ) -> TradeAttempt {
        let order_side = plan.order_side();
        let target = self.target_price(order_side, live, step);
        let request = self.request_for(plan, target);
        let mut diagnostics = vec![format!(
            "live {} {} slippage {} -> limit {}",
            live,
            if order_side == OrderSide::Buy { "+" } else { "-" },
            step,
            target
        )];

        debug!(
            window = %plan.window_id,
            side = %plan.side,
            attempt,
            "{} {} shares of {} @ {}",
            order_side, request.shares, plan.side, target
        );

        let submit = timeout(
            Duration::from_millis(self.config.order_timeout_ms),
            self.exchange.submit_order(&request),
        )
        .await;

        let outcome = match submit {
            Ok(Ok(resp)) => {
                diagnostics.extend(resp.diagnostics.iter().cloned());
                if resp.is_filled() {
                    AttemptOutcome::Filled {
                        price: resp.avg_fill_price.unwrap_or(target),
                        shares: resp.filled_shares,
                    }
                } else {
                    if resp.status == OrderStatus::Open {
                        // Fill-or-kill orders must not rest
                        if let Err(e) = self.exchange.cancel_order(&resp.order_id).await {
                            warn!("Failed to cancel stray order {}: {}", resp.order_id, e);
                        }
                    }
                    AttemptOutcome::NotFilled
                }
            }
            Ok(Err(e)) => {
                warn!(window = %plan.window_id, attempt, "{} attempt failed: {}", order_side, e);
                AttemptOutcome::Error {
                    message: e.to_string(),
                }
            }
            Err(_) => {
                warn!(
                    window = %plan.window_id,
                    attempt,
                    "{} attempt timed out after {}ms",
                    order_side, self.config.order_timeout_ms
                );
                AttemptOutcome::Error {
                    message: format!("timed out after {}ms", self.config.order_timeout_ms),
                }
            }
        };

        TradeAttempt {
            attempt,
            live_price: Some(live),
            slippage: step,
            target_price: Some(target),
            outcome,
            diagnostics,
            at: Utc::now(),
        }
    }
}
