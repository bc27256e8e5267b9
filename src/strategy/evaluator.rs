//! Signal evaluation
//!
//! Decides whether to enter, on which side, and under which strategy. In
//! single-position mode the strategies are tried in order (early entry,
//! checkpoint ladder, last resort) and the first to fire wins the window. In
//! arbitrage mode the divergence model runs continuously, subject to its
//! cooldown and position caps.
//!
//! Evaluation only mutates the window context's one-shot bookkeeping
//! (consumed checkpoints, fired flags); it never places orders.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::adapters::BookSnapshot;
use crate::config::{AppConfig, StrategyConfig, StrategyMode};
use crate::domain::{OddsState, Side, StrategyKind};
use crate::strategy::checkpoint::Checkpoint;
use crate::strategy::context::{PassivePhase, WindowContext};
use crate::strategy::probability::{to_decimal, ImpliedProbabilityModel};

/// Everything the evaluator reads about the market at one instant
#[derive(Debug, Clone)]
pub struct MarketView {
    pub now: DateTime<Utc>,
    pub remaining_secs: f64,
    pub book: BookSnapshot,
    pub reference: Option<Decimal>,
}

impl MarketView {
    pub fn odds(&self) -> &OddsState {
        &self.book.odds
    }
}

/// A decision to enter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub strategy: StrategyKind,
    pub side: Side,
    /// Price observed when the decision was made
    pub decision_price: Option<Decimal>,
    /// Entry attempts stop once time remaining falls below this
    pub cutoff_secs: f64,
    pub checkpoint: Option<usize>,
    pub reason: String,
}

/// Result of consuming one checkpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointOutcome {
    pub checkpoint: Checkpoint,
    pub fired: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub signal: Option<Signal>,
    pub consumed: Vec<CheckpointOutcome>,
}

#[derive(Debug, Clone)]
pub struct SignalEvaluator {
    config: StrategyConfig,
    model: ImpliedProbabilityModel,
    cutoff_buffer_secs: f64,
    min_cutoff_secs: f64,
}

impl SignalEvaluator {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            config: config.strategy.clone(),
            model: ImpliedProbabilityModel::from_config(&config.strategy.arbitrage),
            cutoff_buffer_secs: config.execution.cutoff_buffer_secs,
            min_cutoff_secs: config.execution.min_cutoff_secs,
        }
    }

    pub fn mode(&self) -> StrategyMode {
        self.config.mode
    }

    pub fn model(&self) -> &ImpliedProbabilityModel {
        &self.model
    }

    fn cutoff_for(&self, threshold_secs: f64) -> f64 {
        (threshold_secs - self.cutoff_buffer_secs).max(self.min_cutoff_secs)
    }

    pub fn evaluate(&self, ctx: &mut WindowContext, view: &MarketView) -> Evaluation {
        // A decision seen while an order is executing is dropped
        if ctx.is_in_flight() || view.remaining_secs <= 0.0 {
            return Evaluation::default();
        }

        let evaluation = match self.config.mode {
            StrategyMode::Single => self.evaluate_single(ctx, view),
            StrategyMode::Arbitrage => Evaluation {
                signal: self.divergence_arb(ctx, view),
                consumed: Vec::new(),
            },
        };

        if let Some(signal) = &evaluation.signal {
            ctx.last_signal = Some(format!(
                "{} {} ({})",
                signal.strategy, signal.side, signal.reason
            ));
        }
        evaluation
    }

    fn evaluate_single(&self, ctx: &mut WindowContext, view: &MarketView) -> Evaluation {
        let mut evaluation = Evaluation::default();

        // One entry per window, none after a stop-loss, none while bids rest
        if ctx.has_position()
            || ctx.entries > 0
            || ctx.stop_loss_fired
            || ctx.passive == PassivePhase::Resting
        {
            return evaluation;
        }

        if let Some(signal) = self.early_entry(ctx, view) {
            evaluation.signal = Some(signal);
            return evaluation;
        }

        if self.config.checkpoints.enabled {
            evaluation.signal = self.checkpoint_ladder(ctx, view, &mut evaluation.consumed);
            if evaluation.signal.is_some() {
                return evaluation;
            }
        }

        evaluation.signal = self.last_resort(ctx, view);
        evaluation
    }

    fn early_entry(&self, ctx: &mut WindowContext, view: &MarketView) -> Option<Signal> {
        let cfg = &self.config.early_entry;
        if !cfg.enabled || ctx.early_entry_fired {
            return None;
        }
        if view.remaining_secs > cfg.start_secs || view.remaining_secs < cfg.end_secs {
            return None;
        }

        let (side, probability) = ctx.history.sustained_above(cfg.min_probability, cfg.samples)?;
        ctx.early_entry_fired = true;

        Some(Signal {
            strategy: StrategyKind::EarlyEntry,
            side,
            decision_price: Some(probability),
            cutoff_secs: self.cutoff_for(cfg.end_secs),
            checkpoint: None,
            reason: format!(
                "{} held >= {} for {} samples at T-{:.0}",
                side, cfg.min_probability, cfg.samples, view.remaining_secs
            ),
        })
    }

    fn checkpoint_ladder(
        &self,
        ctx: &mut WindowContext,
        view: &MarketView,
        consumed: &mut Vec<CheckpointOutcome>,
    ) -> Option<Signal> {
        let cfg = &self.config.checkpoints;

        while let Some(checkpoint) = ctx.ladder.take_due(view.remaining_secs) {
            let Some((side, probability)) = view.odds().leader() else {
                consumed.push(CheckpointOutcome {
                    checkpoint,
                    fired: false,
                    reason: "no odds".to_string(),
                });
                continue;
            };

            if probability < checkpoint.min_confidence {
                consumed.push(CheckpointOutcome {
                    checkpoint,
                    fired: false,
                    reason: format!(
                        "{} at {} below {}",
                        side, probability, checkpoint.min_confidence
                    ),
                });
                continue;
            }

            let confirmation = if cfg.confirm_with_reference {
                match (ctx.window.price_to_beat(), view.reference) {
                    (Some(open), Some(reference)) => {
                        let delta = reference - open;
                        let agrees = Side::from_delta(delta) == Some(side);
                        if !agrees || delta.abs() < cfg.min_reference_move_usd {
                            consumed.push(CheckpointOutcome {
                                checkpoint,
                                fired: false,
                                reason: format!(
                                    "{} at {} not confirmed by reference move {}",
                                    side, probability, delta
                                ),
                            });
                            continue;
                        }
                        format!(", reference {:+}", delta)
                    }
                    // No open price: operate without the filter
                    _ => ", unconfirmed".to_string(),
                }
            } else {
                String::new()
            };

            let reason = format!(
                "T-{:.0} {} at {} >= {}{}",
                checkpoint.threshold_secs,
                side,
                probability,
                checkpoint.min_confidence,
                confirmation
            );
            ctx.ladder.mark_fired(checkpoint.index);
            consumed.push(CheckpointOutcome {
                checkpoint,
                fired: true,
                reason: reason.clone(),
            });

            return Some(Signal {
                strategy: StrategyKind::Checkpoint,
                side,
                decision_price: view.book.ask_or_probability(side),
                cutoff_secs: self.cutoff_for(checkpoint.threshold_secs),
                checkpoint: Some(checkpoint.index),
                reason,
            });
        }

        None
    }

    fn last_resort(&self, ctx: &mut WindowContext, view: &MarketView) -> Option<Signal> {
        let cfg = &self.config.last_resort;
        if !cfg.enabled || ctx.last_resort_fired {
            return None;
        }
        if view.remaining_secs > cfg.start_secs || view.remaining_secs < cfg.end_secs {
            return None;
        }
        if self.config.checkpoints.enabled && !ctx.ladder.all_consumed() {
            return None;
        }

        // (a) reference price well away from the open
        let by_reference = match (ctx.window.price_to_beat(), view.reference) {
            (Some(open), Some(reference)) => {
                let delta = reference - open;
                Side::from_delta(delta)
                    .filter(|_| delta.abs() >= cfg.min_reference_move_usd)
                    .map(|side| (side, format!("reference {:+} from open", delta)))
            }
            _ => None,
        };

        // (b) a side surging in the recent samples
        let decision = by_reference.or_else(|| {
            ctx.history
                .surge(cfg.surge_threshold, cfg.surge_samples)
                .map(|(side, rise)| (side, format!("{} surged {:+}", side, rise)))
        });

        let (side, why) = decision?;
        ctx.last_resort_fired = true;

        Some(Signal {
            strategy: StrategyKind::LastResort,
            side,
            decision_price: view.book.ask_or_probability(side),
            cutoff_secs: cfg.end_secs,
            checkpoint: None,
            reason: format!("T-{:.1} {}", view.remaining_secs, why),
        })
    }

    fn divergence_arb(&self, ctx: &WindowContext, view: &MarketView) -> Option<Signal> {
        let cfg = &self.config.arbitrage;
        if view.remaining_secs < cfg.min_remaining_secs
            || ctx.positions.len() >= cfg.max_concurrent_positions
            || ctx.entries >= cfg.max_trades_per_window
        {
            return None;
        }
        if let Some(last) = ctx.last_arb_entry_at {
            if (view.now - last).num_seconds() < cfg.cooldown_secs as i64 {
                return None;
            }
        }

        let open = ctx.window.price_to_beat()?;
        let reference = view.reference?;
        let estimate = self.model.estimate(open, reference, view.remaining_secs)?;

        let mut best: Option<(Side, Decimal, Decimal, Decimal)> = None;
        for side in [Side::Up, Side::Down] {
            if ctx.position_on(side).is_some() {
                continue;
            }
            let Some(ask) = view.book.ask_or_probability(side) else {
                continue;
            };
            if ask > cfg.max_entry_price {
                continue;
            }
            let implied = to_decimal(estimate.probability(side));
            let edge = implied - ask;
            if edge > cfg.divergence_threshold && best.map_or(true, |(_, _, _, e)| edge > e) {
                best = Some((side, implied, ask, edge));
            }
        }

        let (side, implied, ask, edge) = best?;
        Some(Signal {
            strategy: StrategyKind::DivergenceArb,
            side,
            decision_price: Some(ask),
            cutoff_secs: cfg.min_remaining_secs,
            checkpoint: None,
            reason: format!(
                "implied {} vs ask {} (edge {}, dev {:.3}%, k {:.2})",
                implied,
                ask,
                edge,
                estimate.deviation_pct,
                estimate.steepness
            ),
        })
    }

    /// Implied P(side) at the current instant, for snapshots and the CLI
    pub fn implied_probability(
        &self,
        open: Decimal,
        reference: Decimal,
        remaining_secs: f64,
        side: Side,
    ) -> Option<f64> {
        self.model
            .estimate(open, reference, remaining_secs)
            .map(|e| e.probability(side))
    }
}
