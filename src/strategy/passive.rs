//! Passive resting strategy
//!
//! Rests a GTC limit buy on both sides at a fixed price shortly after the
//! window opens. The first side to fill is handed to the engine and the other
//! side is cancelled. Anything still resting is cancelled shortly before the
//! window closes.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::PassiveConfig;
use crate::domain::{MarketWindow, OrderRequest, OrderResponse, Side};
use crate::exchange::ExchangeClient;

#[derive(Debug, Clone, PartialEq)]
pub struct PassiveFill {
    pub window_id: String,
    pub side: Side,
    pub token_id: String,
    pub order_id: String,
    pub price: Decimal,
    pub shares: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PassiveUpdate {
    /// Bids are on the book
    Resting { window_id: String, orders: usize },
    Filled(PassiveFill),
    /// Nothing rests any more
    Finished { window_id: String, reason: String },
}

impl PassiveUpdate {
    pub fn window_id(&self) -> &str {
        match self {
            PassiveUpdate::Resting { window_id, .. } => window_id,
            PassiveUpdate::Filled(fill) => &fill.window_id,
            PassiveUpdate::Finished { window_id, .. } => window_id,
        }
    }
}

/// When the resting bids go on and come off
#[derive(Debug, Clone, Copy)]
pub struct PassiveSchedule {
    pub place_at: Instant,
    pub cancel_at: Instant,
    pub poll_every: Duration,
}

impl PassiveSchedule {
    /// Derive the schedule from how far into the window we are
    pub fn for_window(
        config: &PassiveConfig,
        elapsed_secs: f64,
        remaining_secs: f64,
        poll_every: Duration,
    ) -> Self {
        let now = Instant::now();
        let place_in = (config.place_after_secs - elapsed_secs).max(0.0);
        let cancel_in = (remaining_secs - config.cancel_before_secs).max(0.0);
        Self {
            place_at: now + Duration::from_secs_f64(place_in),
            cancel_at: now + Duration::from_secs_f64(cancel_in),
            poll_every,
        }
    }
}

struct Resting {
    side: Side,
    token_id: String,
    order_id: String,
}

fn fill_from(
    window_id: &str,
    order: &Resting,
    resp: &OrderResponse,
    limit: Decimal,
) -> PassiveFill {
    PassiveFill {
        window_id: window_id.to_string(),
        side: order.side,
        token_id: order.token_id.clone(),
        order_id: order.order_id.clone(),
        price: resp.avg_fill_price.unwrap_or(limit),
        shares: resp.filled_shares,
    }
}

pub fn spawn_passive<M>(
    exchange: Arc<dyn ExchangeClient>,
    config: PassiveConfig,
    window: MarketWindow,
    schedule: PassiveSchedule,
    tx: mpsc::Sender<M>,
) -> JoinHandle<()>
where
    M: From<PassiveUpdate> + Send + 'static,
{
    tokio::spawn(async move {
        let reason = run_passive(exchange.as_ref(), &config, &window, schedule, &tx).await;
        debug!("Passive bids for {} finished: {}", window.id, reason);
        let _ = tx
            .send(M::from(PassiveUpdate::Finished {
                window_id: window.id.clone(),
                reason,
            }))
            .await;
    })
}

async fn run_passive<M>(
    exchange: &dyn ExchangeClient,
    config: &PassiveConfig,
    window: &MarketWindow,
    schedule: PassiveSchedule,
    tx: &mpsc::Sender<M>,
) -> String
where
    M: From<PassiveUpdate> + Send + 'static,
{
    if schedule.place_at >= schedule.cancel_at {
        return "too late to rest bids".to_string();
    }
    sleep_until(schedule.place_at).await;

    let mut resting = Vec::new();
    for side in [Side::Up, Side::Down] {
        let token_id = window.token_id(side).to_string();
        let request =
            OrderRequest::resting_buy(token_id.clone(), side, config.shares, config.price);
        match exchange.submit_order(&request).await {
            Ok(resp) if resp.is_filled() => {
                let order = Resting {
                    side,
                    token_id,
                    order_id: resp.order_id.clone(),
                };
                info!("Passive {} bid filled on placement @ {:?}", side, resp.avg_fill_price);
                let _ = tx
                    .send(M::from(PassiveUpdate::Filled(fill_from(
                        &window.id,
                        &order,
                        &resp,
                        config.price,
                    ))))
                    .await;
                cancel_all(exchange, &resting).await;
                return format!("{} filled on placement", side);
            }
            Ok(resp) if !resp.status.is_terminal() => {
                debug!("Passive {} bid resting as {}", side, resp.order_id);
                resting.push(Resting {
                    side,
                    token_id,
                    order_id: resp.order_id,
                });
            }
            Ok(resp) => warn!("Passive {} bid not accepted: {:?}", side, resp.status),
            Err(e) => warn!("Passive {} bid failed: {}", side, e),
        }
    }

    if resting.is_empty() {
        return "no bids placed".to_string();
    }
    let _ = tx
        .send(M::from(PassiveUpdate::Resting {
            window_id: window.id.clone(),
            orders: resting.len(),
        }))
        .await;

    let mut poll = interval_at(Instant::now() + schedule.poll_every, schedule.poll_every);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let cancel = sleep_until(schedule.cancel_at);
    tokio::pin!(cancel);

    loop {
        tokio::select! {
            _ = poll.tick() => {
                let mut filled = None;
                for (idx, order) in resting.iter().enumerate() {
                    match exchange.get_order(&order.order_id).await {
                        Ok(resp) if resp.is_filled() => {
                            filled = Some((idx, resp));
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!("Passive status poll for {} failed: {}", order.order_id, e)
                        }
                    }
                }

                // Only the first fill is taken; the rest come off the book
                if let Some((idx, resp)) = filled {
                    let order = resting.swap_remove(idx);
                    info!("Passive {} bid filled @ {:?}", order.side, resp.avg_fill_price);
                    let fill = fill_from(&window.id, &order, &resp, config.price);
                    let _ = tx.send(M::from(PassiveUpdate::Filled(fill))).await;
                    cancel_all(exchange, &resting).await;
                    return format!("{} filled", order.side);
                }
            }
            _ = &mut cancel => {
                cancel_all(exchange, &resting).await;
                // A bid may have filled between the last poll and the cancel
                for order in &resting {
                    if let Ok(resp) = exchange.get_order(&order.order_id).await {
                        if resp.is_filled() {
                            let fill = fill_from(&window.id, order, &resp, config.price);
                            let _ = tx.send(M::from(PassiveUpdate::Filled(fill))).await;
                            return format!("{} filled at cancel", order.side);
                        }
                    }
                }
                return "cancelled before close".to_string();
            }
        }
    }
}

async fn cancel_all(exchange: &dyn ExchangeClient, orders: &[Resting]) {
    for order in orders {
        match exchange.cancel_order(&order.order_id).await {
            Ok(true) => debug!("Cancelled passive {} bid {}", order.side, order.order_id),
            Ok(false) => {}
            Err(e) => warn!("Failed to cancel passive bid {}: {}", order.order_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{OddsBook, PaperExchange};
    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal_macros::dec;

    fn setup() -> (OddsBook, Arc<dyn ExchangeClient>, MarketWindow) {
        let now = Utc::now();
        let window =
            MarketWindow::new("w", "t", "up", "down", now, now + ChronoDuration::minutes(15));
        let book = OddsBook::new();
        book.reset(&window);
        book.apply_top("up", Some(dec!(0.52)), Some(dec!(0.54)), now);
        book.apply_top("down", Some(dec!(0.46)), Some(dec!(0.48)), now);
        let exchange: Arc<dyn ExchangeClient> = Arc::new(PaperExchange::new(book.clone()));
        (book, exchange, window)
    }

    fn schedule(cancel_in_secs: u64) -> PassiveSchedule {
        PassiveSchedule {
            place_at: Instant::now(),
            cancel_at: Instant::now() + Duration::from_secs(cancel_in_secs),
            poll_every: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_fill_cancels_other_side() {
        let (book, exchange, window) = setup();
        let (tx, mut rx) = mpsc::channel::<PassiveUpdate>(8);

        spawn_passive(exchange, PassiveConfig::default(), window, schedule(600), tx);
        assert!(matches!(
            rx.recv().await.unwrap(),
            PassiveUpdate::Resting { orders: 2, .. }
        ));

        // DOWN ask drops through the 0.45 bid
        book.apply_top("down", Some(dec!(0.43)), Some(dec!(0.44)), Utc::now());

        match rx.recv().await.unwrap() {
            PassiveUpdate::Filled(fill) => {
                assert_eq!(fill.side, Side::Down);
                assert_eq!(fill.price, dec!(0.45));
                assert_eq!(fill.shares, dec!(10));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            PassiveUpdate::Finished { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_sides_filling_together_yield_one_fill() {
        let (book, exchange, window) = setup();
        let (tx, mut rx) = mpsc::channel::<PassiveUpdate>(8);

        spawn_passive(exchange, PassiveConfig::default(), window, schedule(600), tx);
        assert!(matches!(
            rx.recv().await.unwrap(),
            PassiveUpdate::Resting { orders: 2, .. }
        ));

        // Both asks drop through the 0.45 bids before the next poll
        let now = Utc::now();
        book.apply_top("up", Some(dec!(0.42)), Some(dec!(0.44)), now);
        book.apply_top("down", Some(dec!(0.42)), Some(dec!(0.44)), now);

        match rx.recv().await.unwrap() {
            PassiveUpdate::Filled(fill) => assert_eq!(fill.side, Side::Up),
            other => panic!("unexpected {:?}", other),
        }
        match rx.recv().await.unwrap() {
            PassiveUpdate::Finished { reason, .. } => assert_eq!(reason, "UP filled"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfilled_bids_cancelled_at_deadline() {
        let (_book, exchange, window) = setup();
        let (tx, mut rx) = mpsc::channel::<PassiveUpdate>(8);

        spawn_passive(exchange, PassiveConfig::default(), window, schedule(5), tx);
        assert!(matches!(rx.recv().await.unwrap(), PassiveUpdate::Resting { .. }));
        match rx.recv().await.unwrap() {
            PassiveUpdate::Finished { reason, .. } => assert_eq!(reason, "cancelled before close"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_late_to_place() {
        let (_book, exchange, window) = setup();
        let (tx, mut rx) = mpsc::channel::<PassiveUpdate>(8);

        let config = PassiveConfig::default();
        let late = PassiveSchedule::for_window(&config, 880.0, 20.0, Duration::from_secs(1));
        spawn_passive(exchange, config, window, late, tx);
        match rx.recv().await.unwrap() {
            PassiveUpdate::Finished { reason, .. } => assert_eq!(reason, "too late to rest bids"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
