use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub market: MarketConfig,
    pub feeds: FeedsConfig,
    pub strategy: StrategyConfig,
    pub execution: ExecutionConfig,
    pub risk: RiskConfig,
    pub dry_run: DryRunConfig,
    pub logging: LoggingConfig,
    pub trade_log: TradeLogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Asset symbol used by the price-to-beat lookup (e.g. "BTC")
    pub asset: String,
    /// Event slug prefix; the window slug is `{prefix}-{start_ts}`
    pub slug_prefix: String,
    /// Window length in seconds
    pub interval_secs: u64,
    /// Variant name understood by the price-to-beat endpoint
    pub variant: String,
    /// Gamma REST endpoint for discovery
    pub gamma_url: String,
    /// Price-to-beat REST endpoint
    pub price_to_beat_url: String,
    /// Odds WebSocket endpoint
    pub ws_url: String,
    /// Wait after an empty discovery
    pub seek_retry_secs: u64,
    /// Windows with this many seconds or fewer left are skipped
    pub min_join_remaining_secs: u64,
    /// Delay after window close before seeking the next one
    pub rollover_grace_secs: u64,
    pub price_to_beat_attempts: u32,
    pub price_to_beat_retry_secs: u64,
    /// Interval of the out-of-band retry once the initial attempts are exhausted
    pub price_to_beat_background_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            asset: "BTC".to_string(),
            slug_prefix: "btc-updown-15m".to_string(),
            interval_secs: 900,
            variant: "fifteen".to_string(),
            gamma_url: "https://gamma-api.polymarket.com".to_string(),
            price_to_beat_url: "https://polymarket.com/api/crypto/crypto-price".to_string(),
            ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
            seek_retry_secs: 10,
            min_join_remaining_secs: 5,
            rollover_grace_secs: 5,
            price_to_beat_attempts: 3,
            price_to_beat_retry_secs: 2,
            price_to_beat_background_secs: 10,
            request_timeout_secs: 10,
        }
    }
}

/// Source of the reference asset price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceSource {
    /// Chainlink oracle prices over Polymarket RTDS
    Chainlink,
    /// Binance aggregated trades
    Binance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedsConfig {
    pub reference_source: ReferenceSource,
    /// RTDS symbol (e.g. "btc/usd")
    pub chainlink_symbol: String,
    /// Binance stream symbol (e.g. "btcusdt")
    pub binance_symbol: String,
    pub rtds_url: String,
    pub binance_ws_url: String,
    pub reference_reconnect_secs: u64,
    pub odds_reconnect_secs: u64,
    /// Odds feed reconnects only while the window has more than this left
    pub odds_reconnect_min_remaining_secs: u64,
    pub ping_interval_secs: u64,
    /// How often a live connection checks for silence
    pub health_check_secs: u64,
    /// A feed with no usable data for this long is torn down and reconnected
    pub stale_timeout_secs: u64,
    pub history_sample_secs: u64,
    pub history_capacity: usize,
}

impl Default for FeedsConfig {
    fn default() -> Self {
        Self {
            reference_source: ReferenceSource::Chainlink,
            chainlink_symbol: "btc/usd".to_string(),
            binance_symbol: "btcusdt".to_string(),
            rtds_url: "wss://ws-live-data.polymarket.com".to_string(),
            binance_ws_url: "wss://stream.binance.com:9443/ws".to_string(),
            reference_reconnect_secs: 3,
            odds_reconnect_secs: 1,
            odds_reconnect_min_remaining_secs: 5,
            ping_interval_secs: 5,
            health_check_secs: 15,
            stale_timeout_secs: 90,
            history_sample_secs: 2,
            history_capacity: 30,
        }
    }
}

/// Engine operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyMode {
    /// One entry per window: early entry, checkpoint ladder, last resort, passive
    Single,
    /// Continuous divergence arbitrage with several positions per window
    Arbitrage,
}

impl std::fmt::Display for StrategyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyMode::Single => write!(f, "single"),
            StrategyMode::Arbitrage => write!(f, "arbitrage"),
        }
    }
}

impl std::str::FromStr for StrategyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(StrategyMode::Single),
            "arbitrage" | "arb" => Ok(StrategyMode::Arbitrage),
            other => Err(format!("unknown mode '{}'; expected single|arbitrage", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub mode: StrategyMode,
    /// USD notional per entry
    pub stake_usd: Decimal,
    pub tick_ms: u64,
    pub early_entry: EarlyEntryConfig,
    pub checkpoints: CheckpointConfig,
    pub last_resort: LastResortConfig,
    pub arbitrage: ArbitrageConfig,
    pub passive: PassiveConfig,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            mode: StrategyMode::Single,
            stake_usd: dec!(5),
            tick_ms: 1000,
            early_entry: EarlyEntryConfig::default(),
            checkpoints: CheckpointConfig::default(),
            last_resort: LastResortConfig::default(),
            arbitrage: ArbitrageConfig::default(),
            passive: PassiveConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyEntryConfig {
    pub enabled: bool,
    pub min_probability: Decimal,
    /// Consecutive history samples that must hold the bar
    pub samples: usize,
    /// Earliest point, in seconds remaining
    pub start_secs: f64,
    /// Latest point, in seconds remaining
    pub end_secs: f64,
}

impl Default for EarlyEntryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_probability: dec!(0.94),
            samples: 3,
            start_secs: 240.0,
            end_secs: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointLevel {
    /// Seconds remaining at which this checkpoint becomes due
    pub secs: f64,
    pub min_confidence: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub enabled: bool,
    /// No checkpoint is evaluated below this many seconds remaining
    pub floor_secs: f64,
    pub levels: Vec<CheckpointLevel>,
    /// Require the reference price to confirm the leader
    pub confirm_with_reference: bool,
    pub min_reference_move_usd: Decimal,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            floor_secs: 3.0,
            levels: vec![
                CheckpointLevel {
                    secs: 30.0,
                    min_confidence: dec!(0.90),
                },
                CheckpointLevel {
                    secs: 20.0,
                    min_confidence: dec!(0.88),
                },
                CheckpointLevel {
                    secs: 10.0,
                    min_confidence: dec!(0.85),
                },
                CheckpointLevel {
                    secs: 5.0,
                    min_confidence: dec!(0.80),
                },
            ],
            confirm_with_reference: true,
            min_reference_move_usd: dec!(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LastResortConfig {
    pub enabled: bool,
    pub start_secs: f64,
    pub end_secs: f64,
    pub min_reference_move_usd: Decimal,
    pub surge_threshold: Decimal,
    pub surge_samples: usize,
}

impl Default for LastResortConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start_secs: 3.0,
            end_secs: 1.0,
            min_reference_move_usd: dec!(15),
            surge_threshold: dec!(0.15),
            surge_samples: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrageConfig {
    /// Logistic steepness per percent of deviation at the reference horizon
    pub steepness: f64,
    /// Horizon (seconds remaining) at which steepness applies unscaled
    pub reference_secs: f64,
    /// Minimum `implied - ask` edge to enter
    pub divergence_threshold: Decimal,
    pub cooldown_secs: u64,
    pub max_trades_per_window: u32,
    pub max_concurrent_positions: usize,
    pub min_remaining_secs: f64,
    /// Never pay more than this for a side
    pub max_entry_price: Decimal,
}

impl Default for ArbitrageConfig {
    fn default() -> Self {
        Self {
            steepness: 3.0,
            reference_secs: 60.0,
            divergence_threshold: dec!(0.10),
            cooldown_secs: 15,
            max_trades_per_window: 4,
            max_concurrent_positions: 2,
            min_remaining_secs: 10.0,
            max_entry_price: dec!(0.95),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PassiveConfig {
    pub enabled: bool,
    /// Resting bid price on both sides
    pub price: Decimal,
    pub shares: Decimal,
    /// Seconds after window open before the bids are placed
    pub place_after_secs: f64,
    /// Unfilled bids are cancelled at this many seconds remaining
    pub cancel_before_secs: f64,
}

impl Default for PassiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            price: dec!(0.45),
            shares: dec!(10),
            place_after_secs: 5.0,
            cancel_before_secs: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Additive price tolerance per entry attempt
    pub entry_slippage: Vec<Decimal>,
    pub entry_retry_delay_ms: u64,
    /// Additive price tolerance per stop-loss attempt (subtracted for sells)
    pub exit_slippage: Vec<Decimal>,
    pub exit_retry_delay_ms: u64,
    /// Entry attempts stop once time remaining < checkpoint - buffer
    pub cutoff_buffer_secs: f64,
    pub min_cutoff_secs: f64,
    pub max_price: Decimal,
    pub min_price: Decimal,
    /// Per-call timeout for the exchange
    pub order_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            entry_slippage: vec![dec!(0.03), dec!(0.06), dec!(0.10), dec!(0.14), dec!(0.14)],
            entry_retry_delay_ms: 1500,
            exit_slippage: vec![dec!(0.02), dec!(0.05), dec!(0.10), dec!(0.15)],
            exit_retry_delay_ms: 500,
            cutoff_buffer_secs: 8.0,
            min_cutoff_secs: 3.0,
            max_price: dec!(0.99),
            min_price: dec!(0.01),
            order_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub stop_loss_enabled: bool,
    /// Probability drop from entry that triggers the stop (0.30 = 30 cents)
    pub stop_loss_drop: Decimal,
    /// Also stop out when the reference crosses to the wrong side of the open
    pub reference_cross_enabled: bool,
    /// Distance past the open required to count as a cross
    pub reference_cross_margin_usd: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss_enabled: true,
            stop_loss_drop: dec!(0.30),
            reference_cross_enabled: true,
            reference_cross_margin_usd: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DryRunConfig {
    /// Enable dry run mode (no real orders)
    pub enabled: bool,
}

impl Default for DryRunConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when RUST_LOG is unset
    pub level: String,
    /// Enable JSON formatted logs
    pub json: bool,
    /// Seconds between status lines printed from the snapshot
    pub status_interval_secs: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,updown=debug".to_string(),
            json: false,
            status_interval_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradeLogConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for TradeLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("data/trades.jsonl"),
        }
    }
}

impl AppConfig {
    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with built-in defaults
            .add_source(Config::try_from(&AppConfig::default())?)
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("UPDOWN_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (UPDOWN_STRATEGY__STAKE_USD, etc.)
            .add_source(
                Environment::with_prefix("UPDOWN")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let in_unit = |p: Decimal| p > Decimal::ZERO && p < Decimal::ONE;

        if self.strategy.stake_usd <= Decimal::ZERO {
            errors.push("stake_usd must be positive".to_string());
        }

        if self.market.interval_secs == 0 {
            errors.push("interval_secs must be positive".to_string());
        }

        if self.strategy.tick_ms == 0 || self.feeds.history_sample_secs == 0 {
            errors.push("tick_ms and history_sample_secs must be positive".to_string());
        }

        if self.feeds.history_capacity == 0 {
            errors.push("history_capacity must be positive".to_string());
        }

        if self.feeds.health_check_secs == 0 || self.feeds.stale_timeout_secs == 0 {
            errors.push("health_check_secs and stale_timeout_secs must be positive".to_string());
        }

        let levels = &self.strategy.checkpoints.levels;
        if levels.windows(2).any(|w| w[1].secs > w[0].secs) {
            errors.push("checkpoint time thresholds must be non-increasing".to_string());
        }
        for level in levels {
            if !in_unit(level.min_confidence) {
                errors.push(format!(
                    "checkpoint at {}s: min_confidence must be between 0 and 1",
                    level.secs
                ));
            }
        }

        if !in_unit(self.strategy.early_entry.min_probability) {
            errors.push("early_entry.min_probability must be between 0 and 1".to_string());
        }
        if self.strategy.early_entry.samples == 0 {
            errors.push("early_entry.samples must be positive".to_string());
        }
        if self.strategy.early_entry.end_secs > self.strategy.early_entry.start_secs {
            errors.push("early_entry window must have start_secs >= end_secs".to_string());
        }

        if !in_unit(self.strategy.last_resort.surge_threshold) {
            errors.push("last_resort.surge_threshold must be between 0 and 1".to_string());
        }

        let arb = &self.strategy.arbitrage;
        if !in_unit(arb.divergence_threshold) || !in_unit(arb.max_entry_price) {
            errors.push("arbitrage thresholds must be between 0 and 1".to_string());
        }
        if arb.steepness <= 0.0 || arb.reference_secs <= 0.0 {
            errors.push("arbitrage steepness and reference_secs must be positive".to_string());
        }
        if arb.max_concurrent_positions == 0 {
            errors.push("arbitrage.max_concurrent_positions must be positive".to_string());
        }

        if self.strategy.passive.enabled {
            if !in_unit(self.strategy.passive.price) {
                errors.push("passive.price must be between 0 and 1".to_string());
            }
            if self.strategy.passive.shares <= Decimal::ZERO {
                errors.push("passive.shares must be positive".to_string());
            }
        }

        if self.execution.entry_slippage.is_empty() || self.execution.exit_slippage.is_empty() {
            errors.push("slippage schedules must not be empty".to_string());
        }
        if self
            .execution
            .entry_slippage
            .iter()
            .chain(&self.execution.exit_slippage)
            .any(|s| *s < Decimal::ZERO)
        {
            errors.push("slippage steps must not be negative".to_string());
        }
        if !in_unit(self.execution.max_price)
            || !in_unit(self.execution.min_price)
            || self.execution.min_price >= self.execution.max_price
        {
            errors.push(
                "execution price bounds must satisfy 0 < min_price < max_price < 1".to_string(),
            );
        }

        if !in_unit(self.risk.stop_loss_drop) {
            errors.push("risk.stop_loss_drop must be between 0 and 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.execution.entry_slippage.len(), 5);
        assert_eq!(config.execution.exit_slippage.len(), 4);
        assert_eq!(config.strategy.checkpoints.levels[0].secs, 30.0);
        assert!(config.dry_run.enabled);
    }

    #[test]
    fn test_validate_rejects_increasing_ladder() {
        let mut config = AppConfig::default();
        config.strategy.checkpoints.levels.push(CheckpointLevel {
            secs: 40.0,
            min_confidence: dec!(0.9),
        });
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("non-increasing")));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.strategy.stake_usd = Decimal::ZERO;
        config.execution.entry_slippage.clear();
        config.risk.stop_loss_drop = dec!(1.5);
        config.feeds.stale_timeout_secs = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("stale_timeout_secs")));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("single".parse::<StrategyMode>(), Ok(StrategyMode::Single));
        assert_eq!("ARB".parse::<StrategyMode>(), Ok(StrategyMode::Arbitrage));
        assert!("both".parse::<StrategyMode>().is_err());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("default.toml")).unwrap();
        writeln!(
            file,
            r#"
[strategy]
mode = "arbitrage"
stake_usd = 12.5

[strategy.arbitrage]
max_concurrent_positions = 3

[risk]
stop_loss_drop = 0.25
"#
        )
        .unwrap();

        let config = AppConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.strategy.mode, StrategyMode::Arbitrage);
        assert_eq!(config.strategy.stake_usd, dec!(12.5));
        assert_eq!(config.strategy.arbitrage.max_concurrent_positions, 3);
        assert_eq!(config.risk.stop_loss_drop, dec!(0.25));
        // Untouched sections keep defaults
        assert_eq!(config.execution.entry_retry_delay_ms, 1500);
        assert_eq!(config.strategy.checkpoints.levels.len(), 4);
    }
}
