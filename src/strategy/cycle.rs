//! Market cycle controller
//!
//! Owns the `Seeking -> Active -> Rolling` state machine and the timing rules
//! around it: how long to wait when no joinable window exists, when the active
//! window rolls over, and how the price to beat is fetched for a new window.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::MarketConfig;
use crate::domain::{CycleState, MarketWindow, StateTransition};
use crate::error::{Result, UpDownError};

/// Finds the window that contains a given instant
#[async_trait]
pub trait MarketDiscovery: Send + Sync {
    async fn current_window(&self, now: DateTime<Utc>) -> Result<Option<MarketWindow>>;
}

/// Looks up the reference price captured at window open.
///
/// `Ok(None)` means the price is not published yet.
#[async_trait]
pub trait PriceToBeatSource: Send + Sync {
    async fn price_to_beat(&self, window: &MarketWindow) -> Result<Option<Decimal>>;
}

/// What seeking concluded for one discovery attempt
#[derive(Debug, Clone)]
pub enum SeekOutcome {
    Join(MarketWindow),
    NoWindow { retry_in: Duration },
    TooLate { window_id: String, retry_in: Duration },
}

/// Decide whether a discovered window can be joined
pub fn classify_window(
    found: Option<MarketWindow>,
    now: DateTime<Utc>,
    config: &MarketConfig,
) -> SeekOutcome {
    let Some(window) = found else {
        return SeekOutcome::NoWindow {
            retry_in: Duration::from_secs(config.seek_retry_secs),
        };
    };

    let remaining = window.seconds_remaining_at(now);
    if remaining <= config.min_join_remaining_secs as f64 {
        return SeekOutcome::TooLate {
            window_id: window.id,
            retry_in: Duration::from_secs_f64(remaining + 2.0),
        };
    }

    SeekOutcome::Join(window)
}

/// Delay from `now` until the active window should roll over
pub fn rollover_delay(window: &MarketWindow, now: DateTime<Utc>, grace_secs: u64) -> Duration {
    Duration::from_secs_f64(window.seconds_remaining_at(now) + grace_secs as f64)
}

/// Validated cycle state holder
#[derive(Debug)]
pub struct CycleController {
    state: CycleState,
    last_transition: Option<StateTransition>,
}

impl Default for CycleController {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleController {
    pub fn new() -> Self {
        Self {
            state: CycleState::Seeking,
            last_transition: None,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn last_transition(&self) -> Option<&StateTransition> {
        self.last_transition.as_ref()
    }

    pub fn transition(
        &mut self,
        to: CycleState,
        reason: impl Into<String>,
    ) -> Result<StateTransition> {
        if !self.state.can_transition_to(to) {
            return Err(UpDownError::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }

        let transition = StateTransition::new(self.state, to, reason);
        info!(
            "Cycle {} -> {} ({})",
            transition.from, transition.to, transition.reason
        );
        self.state = to;
        self.last_transition = Some(transition.clone());
        Ok(transition)
    }
}

/// Result of a price-to-beat lookup for one window
#[derive(Debug, Clone, PartialEq)]
pub struct PriceToBeatUpdate {
    pub window_id: String,
    pub price: Option<Decimal>,
    /// Set once the first round of attempts is over
    pub background: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PriceToBeatPolicy {
    pub attempts: u32,
    pub retry_delay: Duration,
    pub background_delay: Duration,
}

impl PriceToBeatPolicy {
    pub fn from_config(config: &MarketConfig) -> Self {
        Self {
            attempts: config.price_to_beat_attempts.max(1),
            retry_delay: Duration::from_secs(config.price_to_beat_retry_secs),
            background_delay: Duration::from_secs(config.price_to_beat_background_secs),
        }
    }
}

async fn lookup(source: &dyn PriceToBeatSource, window: &MarketWindow) -> Option<Decimal> {
    match source.price_to_beat(window).await {
        Ok(price) => price,
        Err(e) => {
            debug!("Price to beat lookup for {} failed: {}", window.id, e);
            None
        }
    }
}

/// Fetch the price to beat for `window` and report through `tx`.
///
/// Makes `policy.attempts` tries spaced by `retry_delay`. If all fail, a
/// `None` update is sent and the lookup continues in the background every
/// `background_delay` until it succeeds or the task is aborted at rollover.
pub fn spawn_price_to_beat<M>(
    source: Arc<dyn PriceToBeatSource>,
    window: MarketWindow,
    policy: PriceToBeatPolicy,
    tx: mpsc::Sender<M>,
) -> JoinHandle<()>
where
    M: From<PriceToBeatUpdate> + Send + 'static,
{
    tokio::spawn(async move {
        for attempt in 1..=policy.attempts {
            if let Some(price) = lookup(source.as_ref(), &window).await {
                info!("Price to beat for {}: {}", window.id, price);
                let _ = tx
                    .send(M::from(PriceToBeatUpdate {
                        window_id: window.id.clone(),
                        price: Some(price),
                        background: false,
                    }))
                    .await;
                return;
            }
            if attempt < policy.attempts {
                sleep(policy.retry_delay).await;
            }
        }

        warn!(
            "Price to beat for {} unavailable after {} attempts, retrying in background",
            window.id, policy.attempts
        );
        if tx
            .send(M::from(PriceToBeatUpdate {
                window_id: window.id.clone(),
                price: None,
                background: true,
            }))
            .await
            .is_err()
        {
            return;
        }

        loop {
            sleep(policy.background_delay).await;
            if tx.is_closed() {
                return;
            }
            if let Some(price) = lookup(source.as_ref(), &window).await {
                info!("Price to beat for {} (background): {}", window.id, price);
                let _ = tx
                    .send(M::from(PriceToBeatUpdate {
                        window_id: window.id.clone(),
                        price: Some(price),
                        background: true,
                    }))
                    .await;
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;

    fn window(remaining_secs: i64) -> (MarketWindow, DateTime<Utc>) {
        let now = Utc::now();
        let end = now + ChronoDuration::seconds(remaining_secs);
        (
            MarketWindow::new("w", "t", "up", "down", end - ChronoDuration::minutes(15), end),
            now,
        )
    }

    #[test]
    fn test_seek_classification() {
        let config = MarketConfig::default();
        let now = Utc::now();

        match classify_window(None, now, &config) {
            SeekOutcome::NoWindow { retry_in } => assert_eq!(retry_in, Duration::from_secs(10)),
            other => panic!("unexpected {:?}", other),
        }

        let (w, now) = window(4);
        match classify_window(Some(w), now, &config) {
            SeekOutcome::TooLate { retry_in, .. } => {
                assert_eq!(retry_in, Duration::from_secs(6))
            }
            other => panic!("unexpected {:?}", other),
        }

        // Exactly 5s left is still too late
        let (w, now) = window(5);
        assert!(matches!(
            classify_window(Some(w), now, &config),
            SeekOutcome::TooLate { .. }
        ));

        let (w, now) = window(6);
        assert!(matches!(
            classify_window(Some(w), now, &config),
            SeekOutcome::Join(_)
        ));
    }

    #[test]
    fn test_rollover_after_grace() {
        let (w, now) = window(100);
        assert_eq!(rollover_delay(&w, now, 5), Duration::from_secs(105));
    }

    #[test]
    fn test_controller_transitions() {
        let mut cycle = CycleController::new();
        assert_eq!(cycle.state(), CycleState::Seeking);

        assert!(cycle.transition(CycleState::Rolling, "skip").is_err());
        cycle.transition(CycleState::Active, "found").unwrap();
        cycle.transition(CycleState::Rolling, "ended").unwrap();
        let t = cycle.transition(CycleState::Seeking, "next").unwrap();
        assert_eq!(t.from, CycleState::Rolling);
        assert_eq!(cycle.last_transition().unwrap().reason, "next");
    }

    struct ScriptedSource(Mutex<VecDeque<Option<Decimal>>>);

    #[async_trait]
    impl PriceToBeatSource for ScriptedSource {
        async fn price_to_beat(&self, _window: &MarketWindow) -> Result<Option<Decimal>> {
            Ok(self.0.lock().pop_front().flatten())
        }
    }

    fn policy() -> PriceToBeatPolicy {
        PriceToBeatPolicy::from_config(&MarketConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_price_to_beat_within_attempts() {
        let source = Arc::new(ScriptedSource(Mutex::new(
            vec![None, Some(dec!(97000))].into(),
        )));
        let (tx, mut rx) = mpsc::channel::<PriceToBeatUpdate>(4);
        let (w, _) = window(600);

        spawn_price_to_beat(source, w, policy(), tx);
        let update = rx.recv().await.unwrap();
        assert_eq!(update.price, Some(dec!(97000)));
        assert!(!update.background);
    }

    #[tokio::test(start_paused = true)]
    async fn test_price_to_beat_falls_back_to_background() {
        let source = Arc::new(ScriptedSource(Mutex::new(
            vec![None, None, None, None, Some(dec!(96500.5))].into(),
        )));
        let (tx, mut rx) = mpsc::channel::<PriceToBeatUpdate>(4);
        let (w, _) = window(600);

        spawn_price_to_beat(source, w, policy(), tx);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.price, None);
        assert!(first.background);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.price, Some(dec!(96500.5)));
    }
}
