use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Side, StrategyKind};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good Till Cancelled
    GTC,
    /// Fill Or Kill
    FOK,
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Resting on the book
    Open,
    /// Order fully filled
    Filled,
    /// Order cancelled
    Cancelled,
    /// Not filled (FOK miss) or rejected by the exchange
    Unfilled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Open)
    }
}

/// Shares are quoted to two decimals; always round down so the notional is never exceeded
pub fn shares_for_notional(notional: Decimal, price: Decimal) -> Decimal {
    if price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (notional / price).round_dp_with_strategy(2, RoundingStrategy::ToZero)
}

/// Order request (what we want to do)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub token_id: String,
    pub market_side: Side,
    pub order_side: OrderSide,
    pub shares: Decimal,
    pub limit_price: Decimal,
    pub time_in_force: TimeInForce,
}

impl OrderRequest {
    /// Fill-or-kill buy sized from a USD notional
    pub fn buy_notional(
        token_id: impl Into<String>,
        market_side: Side,
        notional: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            token_id: token_id.into(),
            market_side,
            order_side: OrderSide::Buy,
            shares: shares_for_notional(notional, price),
            limit_price: price,
            time_in_force: TimeInForce::FOK,
        }
    }

    /// Fill-or-kill sell of an existing holding
    pub fn sell(
        token_id: impl Into<String>,
        market_side: Side,
        shares: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            token_id: token_id.into(),
            market_side,
            order_side: OrderSide::Sell,
            shares,
            limit_price: price,
            time_in_force: TimeInForce::FOK,
        }
    }

    /// Resting GTC buy
    pub fn resting_buy(
        token_id: impl Into<String>,
        market_side: Side,
        shares: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            token_id: token_id.into(),
            market_side,
            order_side: OrderSide::Buy,
            shares,
            limit_price: price,
            time_in_force: TimeInForce::GTC,
        }
    }

    /// Calculate the dollar value of the order
    pub fn value(&self) -> Decimal {
        self.limit_price * self.shares
    }
}

/// Exchange answer to a submission or status poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_shares: Decimal,
    pub avg_fill_price: Option<Decimal>,
    /// Free-form trail supplied by the exchange adapter
    #[serde(default)]
    pub diagnostics: Vec<String>,
}

impl OrderResponse {
    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled && self.filled_shares > Decimal::ZERO
    }
}

/// An open holding created by a confirmed fill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub window_id: String,
    pub side: Side,
    pub token_id: String,
    pub entry_price: Decimal,
    pub shares: Decimal,
    pub strategy: StrategyKind,
    pub entered_at: DateTime<Utc>,
}

impl Position {
    pub fn new(
        window_id: impl Into<String>,
        side: Side,
        token_id: impl Into<String>,
        entry_price: Decimal,
        shares: Decimal,
        strategy: StrategyKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            window_id: window_id.into(),
            side,
            token_id: token_id.into(),
            entry_price,
            shares,
            strategy,
            entered_at: Utc::now(),
        }
    }

    pub fn cost(&self) -> Decimal {
        self.entry_price * self.shares
    }

    /// Realized PnL if sold at `exit_price`
    pub fn pnl_at(&self, exit_price: Decimal) -> Decimal {
        (exit_price - self.entry_price) * self.shares
    }

    /// PnL if the window resolves with `winner`
    pub fn settlement_pnl(&self, winner: Side) -> Decimal {
        if winner == self.side {
            (Decimal::ONE - self.entry_price) * self.shares
        } else {
            -self.cost()
        }
    }
}

/// Result of a single order attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AttemptOutcome {
    Filled { price: Decimal, shares: Decimal },
    NotFilled,
    Error { message: String },
}

/// One retry iteration of an order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeAttempt {
    /// 1-based attempt number
    pub attempt: u8,
    pub live_price: Option<Decimal>,
    pub slippage: Decimal,
    pub target_price: Option<Decimal>,
    pub outcome: AttemptOutcome,
    pub diagnostics: Vec<String>,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_shares_round_down() {
        assert_eq!(shares_for_notional(dec!(5), dec!(0.73)), dec!(6.84));
        assert_eq!(shares_for_notional(dec!(5), dec!(0.5)), dec!(10));
        assert_eq!(shares_for_notional(dec!(5), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_buy_notional_request() {
        let req = OrderRequest::buy_notional("tok", Side::Up, dec!(10), dec!(0.8));
        assert_eq!(req.order_side, OrderSide::Buy);
        assert_eq!(req.shares, dec!(12.5));
        assert_eq!(req.value(), dec!(10.0));
        assert_eq!(req.time_in_force, TimeInForce::FOK);
    }

    #[test]
    fn test_position_pnl() {
        let pos = Position::new(
            "w",
            Side::Up,
            "tok",
            dec!(0.70),
            dec!(10),
            StrategyKind::Checkpoint,
        );
        assert_eq!(pos.cost(), dec!(7.0));
        assert_eq!(pos.pnl_at(dec!(0.39)), dec!(-3.10));
        assert_eq!(pos.settlement_pnl(Side::Up), dec!(3.00));
        assert_eq!(pos.settlement_pnl(Side::Down), dec!(-7.0));
    }

    #[test]
    fn test_attempt_outcome_serializes_tagged() {
        let json = serde_json::to_string(&AttemptOutcome::NotFilled).unwrap();
        assert_eq!(json, r#"{"kind":"not_filled"}"#);
    }
}
