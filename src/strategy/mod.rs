//! Strategy module
//!
//! The decision-and-execution core:
//! - `cycle` - window discovery, rollover timing and the price-to-beat lookup
//! - `evaluator` - early entry, checkpoint ladder, last resort and divergence arbitrage
//! - `executor` - bounded retry engine for entries and stop-loss exits
//! - `risk` - stop-loss triggers
//! - `passive` - resting dual-sided limit bids
//! - `engine` - the loop that owns per-window state and wires everything together

pub mod checkpoint;
pub mod context;
pub mod cycle;
pub mod engine;
pub mod evaluator;
pub mod events;
pub mod executor;
pub mod history;
pub mod passive;
pub mod probability;
pub mod risk;
pub mod trade_logger;

pub use checkpoint::{Checkpoint, CheckpointLadder};
pub use context::{InFlight, PassivePhase, WindowContext};
pub use cycle::{
    classify_window, rollover_delay, CycleController, MarketDiscovery, PriceToBeatSource,
    PriceToBeatUpdate, SeekOutcome,
};
pub use engine::{EngineDeps, EngineMessage, StrategyEngine};
pub use evaluator::{Evaluation, MarketView, Signal, SignalEvaluator};
pub use events::{EngineEvent, EngineSnapshot, EventBus, SnapshotReceiver};
pub use executor::{ExecutionReport, Fill, OrderExecutor, OrderIntent, OrderPlan};
pub use history::{OddsHistory, OddsSample};
pub use passive::{PassiveFill, PassiveUpdate};
pub use probability::{ImpliedEstimate, ImpliedProbabilityModel};
pub use risk::{RiskManager, StopLossTrigger, StopReason};
pub use trade_logger::{LogRecord, SessionTotals, TradeHistoryRecord, TradeLogger};
