//! Strategy engine
//!
//! The single logical owner of all window state. One loop multiplexes:
//! - feed nudges (reference price and odds changes)
//! - results coming back from spawned work (order sequences, price-to-beat
//!   lookups, passive bids), each tagged with the window it belongs to
//! - the evaluation tick and the history sampling tick
//! - shutdown
//!
//! Every handler runs to completion before the next message is taken, so no
//! evaluation ever observes a half-reset window.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::adapters::{FeedEvent, OddsBook, OddsSubscription, ReferencePrice};
use crate::config::{AppConfig, StrategyMode};
use crate::domain::{CycleState, MarketWindow, Position, Side, StrategyKind};
use crate::error::{Result, UpDownError};
use crate::exchange::ExchangeClient;
use crate::strategy::context::{InFlight, PassivePhase, WindowContext};
use crate::strategy::cycle::{
    classify_window, rollover_delay, spawn_price_to_beat, CycleController, MarketDiscovery,
    PriceToBeatPolicy, PriceToBeatSource, PriceToBeatUpdate, SeekOutcome,
};
use crate::strategy::evaluator::{MarketView, Signal, SignalEvaluator};
use crate::strategy::events::{
    EngineEvent, EngineSnapshot, EventBus, SnapshotReceiver, SnapshotSender,
};
use crate::strategy::executor::{ExecutionReport, OrderExecutor, OrderIntent, OrderPlan};
use crate::strategy::history::OddsSample;
use crate::strategy::passive::{spawn_passive, PassiveSchedule, PassiveUpdate};
use crate::strategy::risk::RiskManager;
use crate::strategy::trade_logger::{SettlementRecord, TradeLogger};

const INTERNAL_CHANNEL_CAPACITY: usize = 64;

/// Results flowing back into the engine loop from spawned work
#[derive(Debug)]
pub enum EngineMessage {
    Execution(Box<ExecutionReport>),
    PriceToBeat(PriceToBeatUpdate),
    Passive(PassiveUpdate),
}

impl From<PriceToBeatUpdate> for EngineMessage {
    fn from(update: PriceToBeatUpdate) -> Self {
        EngineMessage::PriceToBeat(update)
    }
}

impl From<PassiveUpdate> for EngineMessage {
    fn from(update: PassiveUpdate) -> Self {
        EngineMessage::Passive(update)
    }
}

/// External collaborators the engine talks to
#[derive(Clone)]
pub struct EngineDeps {
    pub discovery: Arc<dyn MarketDiscovery>,
    pub price_to_beat: Arc<dyn PriceToBeatSource>,
    pub exchange: Arc<dyn ExchangeClient>,
    pub book: OddsBook,
    pub reference: ReferencePrice,
}

pub struct StrategyEngine {
    config: AppConfig,
    discovery: Arc<dyn MarketDiscovery>,
    price_to_beat: Arc<dyn PriceToBeatSource>,
    exchange: Arc<dyn ExchangeClient>,
    executor: OrderExecutor,
    evaluator: SignalEvaluator,
    risk: RiskManager,
    book: OddsBook,
    reference: ReferencePrice,
    logger: Arc<TradeLogger>,
    events: EventBus,
    snapshot_tx: SnapshotSender,
    snapshot_rx: SnapshotReceiver,
    subscription_tx: watch::Sender<Option<OddsSubscription>>,
    cycle: CycleController,
    ctx: Option<WindowContext>,
    /// Price-to-beat and passive tasks of the active window
    window_tasks: Vec<JoinHandle<()>>,
    next_seek: Instant,
    rollover_at: Option<Instant>,
    internal_tx: mpsc::Sender<EngineMessage>,
    internal_rx: Option<mpsc::Receiver<EngineMessage>>,
}

impl StrategyEngine {
    pub fn new(config: AppConfig, deps: EngineDeps, logger: Arc<TradeLogger>) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| UpDownError::Validation(errors.join("; ")))?;

        let events = EventBus::new();
        let executor = OrderExecutor::new(
            Arc::clone(&deps.exchange),
            Arc::new(deps.book.clone()),
            config.execution.clone(),
            events.clone(),
        );
        let (snapshot_tx, snapshot_rx) = watch::channel(EngineSnapshot::idle(CycleState::Seeking));
        let (subscription_tx, _) = watch::channel(None);
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_CHANNEL_CAPACITY);

        Ok(Self {
            evaluator: SignalEvaluator::new(&config),
            risk: RiskManager::new(config.risk.clone()),
            discovery: deps.discovery,
            price_to_beat: deps.price_to_beat,
            exchange: deps.exchange,
            executor,
            book: deps.book,
            reference: deps.reference,
            logger,
            events,
            snapshot_tx,
            snapshot_rx,
            subscription_tx,
            cycle: CycleController::new(),
            ctx: None,
            window_tasks: Vec::new(),
            next_seek: Instant::now(),
            rollover_at: None,
            internal_tx,
            internal_rx: Some(internal_rx),
            config,
        })
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn snapshots(&self) -> SnapshotReceiver {
        self.snapshot_rx.clone()
    }

    /// Subscription handle for the odds feed
    pub fn odds_subscription(&self) -> watch::Receiver<Option<OddsSubscription>> {
        self.subscription_tx.subscribe()
    }

    pub fn state(&self) -> CycleState {
        self.cycle.state()
    }

    pub fn context(&self) -> Option<&WindowContext> {
        self.ctx.as_ref()
    }

    /// Run until `shutdown` resolves
    pub async fn run<F>(mut self, mut feed_rx: mpsc::Receiver<FeedEvent>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let mut internal_rx = self
            .internal_rx
            .take()
            .ok_or_else(|| UpDownError::Internal("engine already running".to_string()))?;

        info!(
            mode = %self.config.strategy.mode,
            dry_run = self.executor.is_dry_run(),
            "Strategy engine starting"
        );
        if let Err(e) = self
            .logger
            .session_start(&self.config.strategy.mode.to_string(), self.executor.is_dry_run())
            .await
        {
            warn!("Failed to write session start: {}", e);
        }

        let mut tick = interval(Duration::from_millis(self.config.strategy.tick_ms.max(50)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sample = interval(Duration::from_secs(
            self.config.feeds.history_sample_secs.max(1),
        ));
        sample.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                Some(event) = feed_rx.recv() => self.on_feed_event(event),
                Some(message) = internal_rx.recv() => self.on_message(message).await,
                _ = tick.tick() => self.on_tick().await,
                _ = sample.tick() => self.sample_history(),
            }
        }

        self.stop().await;
        Ok(())
    }

    async fn stop(&mut self) {
        self.abort_window_tasks();
        self.subscription_tx.send_replace(None);
        if let Some(ctx) = &self.ctx {
            if ctx.has_position() {
                warn!(
                    window = %ctx.id(),
                    "Stopping with {} open position(s)",
                    ctx.positions.len()
                );
            }
        }
        if let Err(e) = self.logger.session_stop().await {
            warn!("Failed to write session stop: {}", e);
        }
        let totals = self.logger.totals();
        info!(
            "Strategy engine stopped: {} entries, {} exits, pnl {}",
            totals.entries, totals.exits, totals.realized_pnl
        );
    }

    // ==================== Loop handlers ====================

    pub async fn on_tick(&mut self) {
        match self.cycle.state() {
            CycleState::Seeking => {
                if Instant::now() >= self.next_seek {
                    self.seek().await;
                }
            }
            CycleState::Active => {
                if self.rollover_at.is_some_and(|at| Instant::now() >= at) {
                    self.roll_over().await;
                } else {
                    self.evaluate();
                }
            }
            CycleState::Rolling => {}
        }
        self.publish_snapshot();
    }

    fn on_feed_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Reference { .. } => self.evaluate(),
            FeedEvent::Odds { window_id, .. } => {
                if self.ctx.as_ref().is_some_and(|ctx| ctx.id() == window_id) {
                    self.evaluate();
                }
            }
            FeedEvent::Status { feed, connected } => {
                if connected {
                    info!("{:?} feed connected", feed);
                } else {
                    warn!("{:?} feed disconnected", feed);
                }
                self.events.emit(EngineEvent::FeedStatus { feed, connected });
            }
        }
    }

    pub async fn on_message(&mut self, message: EngineMessage) {
        match message {
            EngineMessage::Execution(report) => self.on_execution(*report).await,
            EngineMessage::PriceToBeat(update) => self.on_price_to_beat(update),
            EngineMessage::Passive(update) => self.on_passive(update).await,
        }
    }

    fn sample_history(&mut self) {
        let Some(ctx) = self.ctx.as_mut() else {
            return;
        };
        let odds = self.book.odds();
        if let Some(sample) = OddsSample::from_odds(&odds, self.reference.price(), Utc::now()) {
            ctx.history.push(sample);
        }
    }

    // ==================== Cycle ====================

    async fn seek(&mut self) {
        let now = Utc::now();
        let found = match self.discovery.current_window(now).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Market discovery failed: {}", e);
                self.next_seek =
                    Instant::now() + Duration::from_secs(self.config.market.seek_retry_secs);
                return;
            }
        };

        match classify_window(found, now, &self.config.market) {
            SeekOutcome::Join(window) => self.activate(window),
            SeekOutcome::NoWindow { retry_in } => {
                info!("No active window, retrying in {:?}", retry_in);
                self.next_seek = Instant::now() + retry_in;
            }
            SeekOutcome::TooLate {
                window_id,
                retry_in,
            } => {
                info!("Window {} closes too soon, retrying in {:?}", window_id, retry_in);
                self.next_seek = Instant::now() + retry_in;
            }
        }
    }

    /// Make `window` the active one. All per-window state is rebuilt before
    /// any timer, task or subscription for it is armed.
    pub fn activate(&mut self, window: MarketWindow) {
        let ctx = match WindowContext::new(window, &self.config.strategy, &self.config.feeds) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!("Cannot build window state: {}", e);
                self.next_seek =
                    Instant::now() + Duration::from_secs(self.config.market.seek_retry_secs);
                return;
            }
        };

        let transition = match self
            .cycle
            .transition(CycleState::Active, format!("joined {}", ctx.id()))
        {
            Ok(t) => t,
            Err(e) => {
                error!("{}", e);
                return;
            }
        };

        let window = ctx.window.clone();
        let now = Utc::now();
        self.book.reset(&window);
        self.ctx = Some(ctx);

        info!(
            window = %window.id,
            "Window active: {} ({:.0}s remaining)",
            window.title,
            window.seconds_remaining_at(now)
        );
        self.events.emit(EngineEvent::CycleTransition {
            from: transition.from,
            to: transition.to,
            reason: transition.reason,
        });
        self.events.emit(EngineEvent::WindowOpened {
            window_id: window.id.clone(),
            title: window.title.clone(),
            start_time: window.start_time,
            end_time: window.end_time,
        });

        self.rollover_at = Some(
            Instant::now()
                + rollover_delay(&window, now, self.config.market.rollover_grace_secs),
        );

        self.window_tasks.push(spawn_price_to_beat(
            Arc::clone(&self.price_to_beat),
            window.clone(),
            PriceToBeatPolicy::from_config(&self.config.market),
            self.internal_tx.clone(),
        ));

        if self.config.strategy.mode == StrategyMode::Single && self.config.strategy.passive.enabled
        {
            let schedule = PassiveSchedule::for_window(
                &self.config.strategy.passive,
                window.seconds_elapsed_at(now),
                window.seconds_remaining_at(now),
                Duration::from_millis(self.config.strategy.tick_ms.max(50)),
            );
            self.window_tasks.push(spawn_passive(
                Arc::clone(&self.exchange),
                self.config.strategy.passive.clone(),
                window.clone(),
                schedule,
                self.internal_tx.clone(),
            ));
        }

        self.subscription_tx.send_replace(Some(OddsSubscription {
            window_id: window.id.clone(),
            up_token_id: window.up_token_id.clone(),
            down_token_id: window.down_token_id.clone(),
            end_time: window.end_time,
        }));
    }

    async fn roll_over(&mut self) {
        self.transition(CycleState::Rolling, "window closed");
        self.abort_window_tasks();
        self.rollover_at = None;
        self.subscription_tx.send_replace(None);

        if let Some(ctx) = self.ctx.take() {
            self.settle(&ctx).await;
            self.events.emit(EngineEvent::WindowClosed {
                window_id: ctx.id().to_string(),
                open_positions: ctx.positions.len(),
            });
            info!(
                window = %ctx.id(),
                "Window closed: {} entries, realized {}",
                ctx.entries, ctx.realized_pnl
            );
        }
        self.book.clear();

        self.transition(CycleState::Seeking, "looking for next window");
        self.next_seek = Instant::now();
    }

    fn transition(&mut self, to: CycleState, reason: &str) {
        match self.cycle.transition(to, reason) {
            Ok(t) => self.events.emit(EngineEvent::CycleTransition {
                from: t.from,
                to: t.to,
                reason: t.reason,
            }),
            Err(e) => error!("{}", e),
        }
    }

    /// Estimate the outcome of positions still held at close
    async fn settle(&self, ctx: &WindowContext) {
        if !ctx.has_position() {
            return;
        }

        let open = ctx.window.price_to_beat();
        let reference = self.reference.price();
        let winner = match (open, reference) {
            (Some(open), Some(reference)) => Side::from_delta(reference - open),
            _ => None,
        };
        let pnl = match winner {
            Some(winner) => ctx
                .positions
                .iter()
                .map(|p| p.settlement_pnl(winner))
                .sum::<Decimal>(),
            None => Decimal::ZERO,
        };

        match winner {
            Some(side) => info!(
                window = %ctx.id(),
                "Estimated settlement: {} wins, pnl {}",
                side,
                pnl
            ),
            None => warn!(
                window = %ctx.id(),
                "Cannot estimate settlement without open and reference prices"
            ),
        }

        self.events.emit(EngineEvent::Settlement {
            window_id: ctx.id().to_string(),
            winner,
            pnl,
        });
        let record = SettlementRecord {
            timestamp: Utc::now(),
            window_id: ctx.id().to_string(),
            price_to_beat: open,
            final_reference: reference,
            winner,
            positions: ctx.positions.len(),
            pnl,
        };
        if let Err(e) = self.logger.record_settlement(record).await {
            warn!("Failed to log settlement: {}", e);
        }
    }

    fn abort_window_tasks(&mut self) {
        for task in self.window_tasks.drain(..) {
            task.abort();
        }
    }

    // ==================== Evaluation ====================

    fn market_view(&self, ctx: &WindowContext, now: DateTime<Utc>) -> Option<MarketView> {
        let remaining_secs = ctx.seconds_remaining_at(now);
        if remaining_secs <= 0.0 {
            return None;
        }
        let book = self.book.snapshot();
        if book.window_id.as_deref() != Some(ctx.id()) {
            return None;
        }
        Some(MarketView {
            now,
            remaining_secs,
            book,
            reference: self.reference.price(),
        })
    }

    /// Stop-loss first, then entry signals
    pub fn evaluate(&mut self) {
        if !self.cycle.state().is_trading() {
            return;
        }
        let Some(ctx) = self.ctx.as_ref() else {
            return;
        };
        let Some(view) = self.market_view(ctx, Utc::now()) else {
            return;
        };

        self.check_stop_loss(&view);

        let Some(ctx) = self.ctx.as_mut() else {
            return;
        };
        let evaluation = self.evaluator.evaluate(ctx, &view);

        for outcome in &evaluation.consumed {
            info!(
                window = %ctx.id(),
                "Checkpoint T-{} {}: {}",
                outcome.checkpoint.threshold_secs,
                if outcome.fired { "fired" } else { "skipped" },
                outcome.reason
            );
            self.events.emit(EngineEvent::CheckpointConsumed {
                window_id: ctx.id().to_string(),
                index: outcome.checkpoint.index,
                threshold_secs: outcome.checkpoint.threshold_secs,
                fired: outcome.fired,
                reason: outcome.reason.clone(),
            });
        }

        if let Some(signal) = evaluation.signal {
            self.start_entry(signal, &view);
        }
    }

    fn check_stop_loss(&mut self, view: &MarketView) {
        if !self.risk.enabled() {
            return;
        }
        let Some(ctx) = self.ctx.as_mut() else {
            return;
        };
        if ctx.is_in_flight() {
            return;
        }

        let open = ctx.window.price_to_beat();
        let trigger = ctx.positions.iter().find_map(|position| {
            self.risk
                .check(position, view.odds().get(position.side), view.reference, open)
                .map(|trigger| (position.clone(), trigger))
        });
        let Some((position, trigger)) = trigger else {
            return;
        };

        if !ctx.try_begin(InFlight::Exit {
            position_id: position.id.clone(),
            started_at: view.now,
        }) {
            return;
        }
        ctx.stop_loss_fired = true;

        warn!(
            window = %ctx.id(),
            side = %position.side,
            strategy = %position.strategy,
            "Stop-loss triggered: {}",
            trigger.describe()
        );
        self.events.emit(EngineEvent::StopLossTriggered {
            window_id: ctx.id().to_string(),
            position_id: position.id.clone(),
            reasons: trigger.reasons,
        });

        let plan = OrderPlan::exit(&position, deadline_in(view.remaining_secs));
        spawn_execution(&self.executor, &self.internal_tx, plan);
    }

    fn start_entry(&mut self, signal: Signal, view: &MarketView) {
        let Some(ctx) = self.ctx.as_mut() else {
            return;
        };
        if !ctx.try_begin(InFlight::Entry {
            strategy: signal.strategy,
            side: signal.side,
            started_at: view.now,
        }) {
            return;
        }
        if signal.strategy == StrategyKind::DivergenceArb {
            ctx.last_arb_entry_at = Some(view.now);
        }

        info!(
            window = %ctx.id(),
            side = %signal.side,
            strategy = %signal.strategy,
            price = ?signal.decision_price,
            "Entry signal: {}",
            signal.reason
        );
        self.events.emit(EngineEvent::Signal {
            window_id: ctx.id().to_string(),
            strategy: signal.strategy,
            side: signal.side,
            reason: signal.reason.clone(),
        });

        let plan = OrderPlan::entry(
            ctx.id(),
            signal.side,
            ctx.window.token_id(signal.side),
            signal.strategy,
            self.config.strategy.stake_usd,
            deadline_in(view.remaining_secs),
            signal.cutoff_secs,
        );
        spawn_execution(&self.executor, &self.internal_tx, plan);
    }

    // ==================== Results ====================

    async fn on_execution(&mut self, report: ExecutionReport) {
        let window_id = report.plan.window_id.clone();
        let current = self.ctx.as_mut().filter(|ctx| ctx.id() == window_id);

        let Some(ctx) = current else {
            warn!(
                window = %window_id,
                "Discarding {} result for a window that is no longer active ({})",
                report.plan.order_side(),
                report.failure_reason()
            );
            if let Err(e) = self.logger.record_execution(&report, None).await {
                warn!("Failed to log trade: {}", e);
            }
            return;
        };
        ctx.finish_flight();

        let mut pnl = None;
        match &report.plan.intent {
            OrderIntent::Enter { .. } => match report.position() {
                Some(position) => {
                    info!(
                        window = %window_id,
                        side = %position.side,
                        strategy = %position.strategy,
                        price = %position.entry_price,
                        "Position opened: {} shares",
                        position.shares
                    );
                    ctx.add_position(position.clone());
                    self.events.emit(EngineEvent::Filled {
                        window_id: window_id.clone(),
                        position,
                    });
                }
                None => {
                    warn!(
                        window = %window_id,
                        side = %report.plan.side,
                        strategy = %report.plan.strategy,
                        "Entry failed after {} attempt(s): {}",
                        report.attempts.len(),
                        report.failure_reason()
                    );
                    self.events.emit(EngineEvent::EntryFailed {
                        window_id: window_id.clone(),
                        strategy: report.plan.strategy,
                        side: report.plan.side,
                        reason: report.failure_reason(),
                    });
                }
            },
            OrderIntent::Exit { position_id, .. } => match report.fill {
                Some(fill) => {
                    if let Some(position) = ctx.remove_position(position_id) {
                        let realized = (fill.price - position.entry_price) * fill.shares;
                        ctx.realized_pnl += realized;
                        pnl = Some(realized);
                        info!(
                            window = %window_id,
                            side = %position.side,
                            strategy = %position.strategy,
                            price = %fill.price,
                            "Stop-loss exit filled: {} -> {}, pnl {}",
                            position.entry_price,
                            fill.price,
                            realized
                        );
                        self.events.emit(EngineEvent::LossReport {
                            window_id: window_id.clone(),
                            position_id: position.id.clone(),
                            side: position.side,
                            strategy: position.strategy,
                            entry_price: position.entry_price,
                            exit_price: fill.price,
                            shares: fill.shares,
                            pnl: realized,
                        });
                    }
                }
                None => {
                    // Position stays open; the next tick re-evaluates the stop
                    error!(
                        window = %window_id,
                        side = %report.plan.side,
                        "Stop-loss exit failed after {} attempt(s): {}",
                        report.attempts.len(),
                        report.failure_reason()
                    );
                    self.events.emit(EngineEvent::StopLossFailed {
                        window_id: window_id.clone(),
                        position_id: position_id.clone(),
                        reason: report.failure_reason(),
                    });
                }
            },
        }

        if let Err(e) = self.logger.record_execution(&report, pnl).await {
            warn!("Failed to log trade: {}", e);
        }
    }

    fn on_price_to_beat(&mut self, update: PriceToBeatUpdate) {
        let Some(ctx) = self.ctx.as_mut().filter(|ctx| ctx.id() == update.window_id) else {
            debug!("Ignoring price to beat for {}", update.window_id);
            return;
        };

        if let Some(price) = update.price {
            if !ctx.window.set_price_to_beat(price) {
                return;
            }
        }
        self.events.emit(EngineEvent::PriceToBeat {
            window_id: update.window_id,
            price: update.price,
        });
    }

    async fn on_passive(&mut self, update: PassiveUpdate) {
        let Some(ctx) = self.ctx.as_mut().filter(|ctx| ctx.id() == update.window_id()) else {
            debug!("Ignoring passive update for {}", update.window_id());
            return;
        };

        match update {
            PassiveUpdate::Resting { orders, .. } => {
                info!(window = %ctx.id(), "{} passive bid(s) resting", orders);
                ctx.passive = PassivePhase::Resting;
            }
            PassiveUpdate::Filled(fill) => {
                let position = Position::new(
                    fill.window_id.clone(),
                    fill.side,
                    fill.token_id.clone(),
                    fill.price,
                    fill.shares,
                    StrategyKind::PassiveResting,
                );
                info!(
                    window = %ctx.id(),
                    side = %position.side,
                    price = %position.entry_price,
                    "Passive bid filled: {} shares",
                    position.shares
                );
                ctx.add_position(position.clone());
                self.events.emit(EngineEvent::Filled {
                    window_id: fill.window_id.clone(),
                    position,
                });
                if let Err(e) = self.logger.record_passive_fill(&fill).await {
                    warn!("Failed to log passive fill: {}", e);
                }
            }
            PassiveUpdate::Finished { reason, .. } => {
                debug!(window = %ctx.id(), "Passive bids done: {}", reason);
                ctx.passive = PassivePhase::Done;
            }
        }
    }

    // ==================== Snapshot ====================

    pub fn snapshot(&self) -> EngineSnapshot {
        let mut snapshot = EngineSnapshot::idle(self.cycle.state());
        snapshot.reference_price = self.reference.price();
        snapshot.totals = self.logger.totals();

        if let Some(ctx) = &self.ctx {
            let book = self.book.snapshot();
            snapshot.window_id = Some(ctx.id().to_string());
            snapshot.title = Some(ctx.window.title.clone());
            snapshot.seconds_remaining = Some(ctx.seconds_remaining_at(snapshot.at));
            snapshot.price_to_beat = ctx.window.price_to_beat();
            if let (Some(open), Some(reference)) =
                (snapshot.price_to_beat, snapshot.reference_price)
            {
                snapshot.implied_up = self.evaluator.implied_probability(
                    open,
                    reference,
                    snapshot.seconds_remaining.unwrap_or(0.0),
                    Side::Up,
                );
            }
            snapshot.odds_up = book.odds.up;
            snapshot.odds_down = book.odds.down;
            snapshot.up_quote = book.up;
            snapshot.down_quote = book.down;
            snapshot.last_signal = ctx.last_signal.clone();
            snapshot.positions = ctx.positions.clone();
            snapshot.in_flight = ctx.is_in_flight();
        }
        snapshot
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }
}

fn deadline_in(remaining_secs: f64) -> Instant {
    Instant::now() + Duration::from_secs_f64(remaining_secs.max(0.0))
}

fn spawn_execution(
    executor: &OrderExecutor,
    tx: &mpsc::Sender<EngineMessage>,
    plan: OrderPlan,
) {
    let executor = executor.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        let report = executor.execute(plan).await;
        if tx
            .send(EngineMessage::Execution(Box::new(report)))
            .await
            .is_err()
        {
            debug!("Engine stopped before execution result arrived");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::PaperExchange;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    struct StaticDiscovery(Mutex<Option<MarketWindow>>);

    #[async_trait]
    impl MarketDiscovery for StaticDiscovery {
        async fn current_window(&self, _now: DateTime<Utc>) -> Result<Option<MarketWindow>> {
            Ok(self.0.lock().clone())
        }
    }

    struct FixedOpen(Option<Decimal>);

    #[async_trait]
    impl PriceToBeatSource for FixedOpen {
        async fn price_to_beat(&self, _window: &MarketWindow) -> Result<Option<Decimal>> {
            Ok(self.0)
        }
    }

    fn window(remaining_secs: i64) -> MarketWindow {
        let end = Utc::now() + ChronoDuration::seconds(remaining_secs);
        MarketWindow::new(
            "w1",
            "BTC up or down",
            "up",
            "down",
            end - ChronoDuration::minutes(15),
            end,
        )
    }

    fn engine(window: Option<MarketWindow>) -> (StrategyEngine, OddsBook, ReferencePrice) {
        let book = OddsBook::new();
        let reference = ReferencePrice::new();
        let deps = EngineDeps {
            discovery: Arc::new(StaticDiscovery(Mutex::new(window))),
            price_to_beat: Arc::new(FixedOpen(Some(dec!(97000)))),
            exchange: Arc::new(PaperExchange::new(book.clone())),
            book: book.clone(),
            reference: reference.clone(),
        };
        let engine =
            StrategyEngine::new(AppConfig::default(), deps, Arc::new(TradeLogger::disabled()))
                .unwrap();
        (engine, book, reference)
    }

    #[tokio::test]
    async fn test_seek_joins_window_and_subscribes() {
        let (mut engine, book, _) = engine(Some(window(600)));
        let subscription = engine.odds_subscription();

        engine.on_tick().await;
        assert_eq!(engine.state(), CycleState::Active);
        assert_eq!(engine.context().unwrap().id(), "w1");
        assert_eq!(book.window_id().as_deref(), Some("w1"));
        assert_eq!(
            subscription.borrow().as_ref().map(|s| s.window_id.clone()),
            Some("w1".to_string())
        );
    }

    #[tokio::test]
    async fn test_seek_skips_window_about_to_close() {
        let (mut engine, _, _) = engine(Some(window(3)));
        engine.on_tick().await;
        assert_eq!(engine.state(), CycleState::Seeking);
        assert!(engine.context().is_none());
    }

    #[tokio::test]
    async fn test_stale_execution_result_is_discarded() {
        let (mut engine, _, _) = engine(Some(window(600)));
        engine.on_tick().await;

        let plan = OrderPlan::entry(
            "old-window",
            Side::Up,
            "up",
            StrategyKind::Checkpoint,
            dec!(5),
            Instant::now(),
            3.0,
        );
        let report = ExecutionReport {
            plan,
            attempts: Vec::new(),
            fill: Some(crate::strategy::executor::Fill {
                price: dec!(0.9),
                shares: dec!(5.55),
            }),
            error: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        engine
            .on_message(EngineMessage::Execution(Box::new(report)))
            .await;
        assert!(!engine.context().unwrap().has_position());
    }

    #[tokio::test]
    async fn test_price_to_beat_applied_for_current_window() {
        let (mut engine, _, _) = engine(Some(window(600)));
        engine.on_tick().await;

        engine
            .on_message(EngineMessage::PriceToBeat(PriceToBeatUpdate {
                window_id: "w1".into(),
                price: Some(dec!(97123)),
                background: false,
            }))
            .await;
        engine
            .on_message(EngineMessage::PriceToBeat(PriceToBeatUpdate {
                window_id: "other".into(),
                price: Some(dec!(1)),
                background: false,
            }))
            .await;
        assert_eq!(
            engine.context().unwrap().window.price_to_beat(),
            Some(dec!(97123))
        );
    }

    #[tokio::test]
    async fn test_snapshot_reflects_window() {
        let (mut engine, book, reference) = engine(Some(window(600)));
        engine.on_tick().await;
        book.apply_probability("up", dec!(0.62), Utc::now());
        reference.update(dec!(97010), Utc::now());

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.state, CycleState::Active);
        assert_eq!(snapshot.odds_up, Some(dec!(0.62)));
        assert_eq!(snapshot.odds_down, Some(dec!(0.38)));
        assert_eq!(snapshot.reference_price, Some(dec!(97010)));

        engine
            .ctx
            .as_mut()
            .unwrap()
            .window
            .set_price_to_beat(dec!(97000));
        let implied = engine.snapshot().implied_up.unwrap();
        assert!(implied > 0.5 && implied < 1.0);
    }

    #[tokio::test]
    async fn test_failed_stop_loss_exit_rearms_on_next_evaluation() {
        let (mut engine, book, _) = engine(Some(window(600)));
        engine.on_tick().await;

        let position = Position::new(
            "w1",
            Side::Up,
            "up",
            dec!(0.70),
            dec!(10),
            StrategyKind::Checkpoint,
        );
        engine.ctx.as_mut().unwrap().add_position(position.clone());
        book.apply_probability("up", dec!(0.39), Utc::now());

        engine.evaluate();
        let ctx = engine.context().unwrap();
        assert!(ctx.is_in_flight());
        assert!(ctx.stop_loss_fired);

        let report = ExecutionReport {
            plan: OrderPlan::exit(&position, Instant::now()),
            attempts: Vec::new(),
            fill: None,
            error: Some(crate::error::OrderError::MaxAttemptsExceeded { attempts: 4 }),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        engine
            .on_message(EngineMessage::Execution(Box::new(report)))
            .await;

        let ctx = engine.context().unwrap();
        assert!(!ctx.is_in_flight());
        assert_eq!(ctx.positions.len(), 1);

        // Odds are still below the stop, so the exit starts again
        engine.evaluate();
        assert!(engine.context().unwrap().is_in_flight());
    }
}
