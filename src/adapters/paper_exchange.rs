//! Paper exchange used in dry-run mode.
//!
//! Orders fill at their limit price whenever the live book would let them
//! through: a buy when its limit reaches the best ask, a sell when its limit
//! is at or under the best bid. The side's probability stands in for a
//! missing quote. Resting (GTC) orders are re-checked on every status poll.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::OddsBook;
use crate::domain::{OrderRequest, OrderResponse, OrderSide, OrderStatus, TimeInForce};
use crate::error::{Result, UpDownError};
use crate::exchange::{ExchangeClient, ExchangeKind, LivePriceSource};

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    response: OrderResponse,
}

#[derive(Debug, Clone)]
pub struct PaperExchange {
    book: OddsBook,
    orders: Arc<Mutex<HashMap<String, PaperOrder>>>,
}

impl PaperExchange {
    pub fn new(book: OddsBook) -> Self {
        Self {
            book,
            orders: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Would `request` cross the live book right now?
    fn crosses(&self, request: &OrderRequest) -> (bool, String) {
        match request.order_side {
            OrderSide::Buy => match self.book.buy_price(&request.token_id) {
                Some(ask) => (
                    request.limit_price >= ask,
                    format!("paper: limit {} vs ask {}", request.limit_price, ask),
                ),
                None => (false, "paper: no live ask for token".to_string()),
            },
            OrderSide::Sell => match self.book.sell_price(&request.token_id) {
                Some(bid) => (
                    request.limit_price <= bid,
                    format!("paper: limit {} vs bid {}", request.limit_price, bid),
                ),
                None => (false, "paper: no live bid for token".to_string()),
            },
        }
    }

    fn evaluate(&self, order_id: &str, request: &OrderRequest) -> OrderResponse {
        let (fills, note) = self.crosses(request);
        let status = match (fills, request.time_in_force) {
            (true, _) => OrderStatus::Filled,
            (false, TimeInForce::FOK) => OrderStatus::Unfilled,
            (false, TimeInForce::GTC) => OrderStatus::Open,
        };

        OrderResponse {
            order_id: order_id.to_string(),
            status,
            filled_shares: if fills { request.shares } else { Decimal::ZERO },
            avg_fill_price: fills.then_some(request.limit_price),
            diagnostics: vec![note],
        }
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Paper
    }

    fn is_dry_run(&self) -> bool {
        true
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderResponse> {
        if request.shares <= Decimal::ZERO {
            return Err(UpDownError::OrderRejected(format!(
                "non-positive size {}",
                request.shares
            )));
        }

        let order_id = format!("paper-{}", Uuid::new_v4());
        let response = self.evaluate(&order_id, request);
        debug!(
            "Paper {} {} {} @ {} -> {:?}",
            request.order_side,
            request.shares,
            request.market_side,
            request.limit_price,
            response.status
        );

        if response.status == OrderStatus::Open {
            self.orders.lock().insert(
                order_id,
                PaperOrder {
                    request: request.clone(),
                    response: response.clone(),
                },
            );
        }

        Ok(response)
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderResponse> {
        let mut orders = self.orders.lock();
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| UpDownError::OrderSubmission(format!("unknown order {}", order_id)))?;

        if order.response.status == OrderStatus::Open {
            order.response = self.evaluate(order_id, &order.request);
        }
        Ok(order.response.clone())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        let mut orders = self.orders.lock();
        match orders.get_mut(order_id) {
            Some(order) if order.response.status == OrderStatus::Open => {
                order.response.status = OrderStatus::Cancelled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MarketWindow, Side};
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn setup() -> (OddsBook, PaperExchange) {
        let now = Utc::now();
        let book = OddsBook::new();
        book.reset(&MarketWindow::new(
            "w",
            "t",
            "up",
            "down",
            now,
            now + Duration::minutes(15),
        ));
        book.apply_top("up", Some(dec!(0.70)), Some(dec!(0.72)), now);
        let exchange = PaperExchange::new(book.clone());
        (book, exchange)
    }

    #[tokio::test]
    async fn test_buy_fills_at_or_above_ask() {
        let (_book, ex) = setup();

        let miss = OrderRequest::buy_notional("up", Side::Up, dec!(5), dec!(0.71));
        let resp = ex.submit_order(&miss).await.unwrap();
        assert_eq!(resp.status, OrderStatus::Unfilled);
        assert!(!resp.is_filled());

        let hit = OrderRequest::buy_notional("up", Side::Up, dec!(5), dec!(0.74));
        let resp = ex.submit_order(&hit).await.unwrap();
        assert!(resp.is_filled());
        assert_eq!(resp.avg_fill_price, Some(dec!(0.74)));
        assert_eq!(resp.filled_shares, hit.shares);
    }

    #[tokio::test]
    async fn test_sell_fills_at_or_below_bid() {
        let (_book, ex) = setup();
        let resp = ex
            .submit_order(&OrderRequest::sell("up", Side::Up, dec!(10), dec!(0.69)))
            .await
            .unwrap();
        assert!(resp.is_filled());

        let resp = ex
            .submit_order(&OrderRequest::sell("up", Side::Up, dec!(10), dec!(0.75)))
            .await
            .unwrap();
        assert_eq!(resp.status, OrderStatus::Unfilled);
    }

    #[tokio::test]
    async fn test_resting_order_fills_when_book_moves() {
        let (book, ex) = setup();
        let req = OrderRequest::resting_buy("down", Side::Down, dec!(10), dec!(0.25));
        let resp = ex.submit_order(&req).await.unwrap();
        // Down probability is 0.29 with no quote
        assert_eq!(resp.status, OrderStatus::Open);

        book.apply_top("down", Some(dec!(0.22)), Some(dec!(0.24)), Utc::now());
        let polled = ex.get_order(&resp.order_id).await.unwrap();
        assert!(polled.is_filled());
        assert!(!ex.cancel_order(&resp.order_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_open_order() {
        let (_book, ex) = setup();
        let req = OrderRequest::resting_buy("up", Side::Up, dec!(10), dec!(0.40));
        let resp = ex.submit_order(&req).await.unwrap();
        assert!(ex.cancel_order(&resp.order_id).await.unwrap());
        let polled = ex.get_order(&resp.order_id).await.unwrap();
        assert_eq!(polled.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_token_never_fills() {
        let (_book, ex) = setup();
        let req = OrderRequest::buy_notional("stale", Side::Up, dec!(5), dec!(0.99));
        let resp = ex.submit_order(&req).await.unwrap();
        assert_eq!(resp.status, OrderStatus::Unfilled);
    }
}
