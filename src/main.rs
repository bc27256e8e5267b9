use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use updown::adapters::{
    CryptoPriceClient, GammaClient, OddsBook, OddsFeed, ReferencePrice, ReferencePriceFeed,
};
use updown::cli::{self, Cli, Commands};
use updown::config::AppConfig;
use updown::error::{Result, UpDownError};
use updown::exchange::build_exchange_client;
use updown::strategy::{
    EngineDeps, EngineEvent, ImpliedProbabilityModel, StrategyEngine, TradeLogger,
};

const FEED_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Current) => {
            init_logging_simple();
            let config = load_config(&cli.config)?;
            let discovery = GammaClient::new(&config.market)?;
            let prices = CryptoPriceClient::new(&config.market)?;
            cli::show_current_window(&discovery, &prices).await?;
        }
        Some(Commands::Implied {
            deviation_pct,
            steepness,
        }) => {
            let config = load_config(&cli.config)?;
            let model = ImpliedProbabilityModel::new(
                steepness.unwrap_or(config.strategy.arbitrage.steepness),
                config.strategy.arbitrage.reference_secs,
            );
            cli::print_implied_table(&model, deviation_pct)?;
        }
        Some(Commands::Run {
            mode,
            dry_run,
            json_logs,
        }) => {
            let mut config = load_config(&cli.config)?;
            if let Some(mode) = mode {
                config.strategy.mode = mode;
            }
            if dry_run {
                config.dry_run.enabled = true;
            }
            config.logging.json |= json_logs;
            init_logging(&config);
            run_engine(config).await?;
        }
        None => {
            let config = load_config(&cli.config)?;
            init_logging(&config);
            run_engine(config).await?;
        }
    }

    Ok(())
}

fn load_config(dir: &str) -> anyhow::Result<AppConfig> {
    AppConfig::load_from(dir).with_context(|| format!("failed to load config from {}", dir))
}

async fn run_engine(config: AppConfig) -> Result<()> {
    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("Config: {}", e);
        }
        return Err(UpDownError::Validation(errors.join("; ")));
    }

    info!(
        "Starting updown: {} {} every {}s, mode {}, dry_run {}",
        config.market.asset,
        config.market.slug_prefix,
        config.market.interval_secs,
        config.strategy.mode,
        config.dry_run.enabled
    );

    let book = OddsBook::new();
    let reference = ReferencePrice::new();
    let (feed_tx, feed_rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);

    let deps = EngineDeps {
        discovery: Arc::new(GammaClient::new(&config.market)?),
        price_to_beat: Arc::new(CryptoPriceClient::new(&config.market)?),
        exchange: build_exchange_client(&config, book.clone())?,
        book: book.clone(),
        reference: reference.clone(),
    };
    let logger = Arc::new(TradeLogger::new(&config.trade_log));
    let engine = StrategyEngine::new(config.clone(), deps, logger)?;

    let reference_feed = ReferencePriceFeed::new(&config.feeds, reference, feed_tx.clone());
    let reference_task = tokio::spawn(async move {
        if let Err(e) = reference_feed.run().await {
            error!("Reference feed stopped: {}", e);
        }
    });

    let odds_feed = OddsFeed::new(config.market.ws_url.clone(), &config.feeds, book, feed_tx);
    let subscription = engine.odds_subscription();
    let odds_task = tokio::spawn(async move {
        if let Err(e) = odds_feed.run(subscription).await {
            error!("Odds feed stopped: {}", e);
        }
    });

    let mut events = engine.events().subscribe();
    let events_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event log lagged by {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let snapshots = engine.snapshots();
    let status_every = Duration::from_secs(config.logging.status_interval_secs.max(1));
    let status_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(status_every);
        loop {
            ticker.tick().await;
            info!("{}", snapshots.borrow().status_line());
        }
    });

    let result = engine.run(feed_rx, shutdown_signal()).await;

    reference_task.abort();
    odds_task.abort();
    events_task.abort();
    status_task.abort();
    info!("Shutdown complete");

    result
}

fn log_event(event: &EngineEvent) {
    match serde_json::to_string(event) {
        Ok(json) => tracing::debug!(target: "updown::events", "{}", json),
        Err(e) => warn!("Failed to encode event: {}", e),
    }
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.json {
        let _ = tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .try_init();
    }
}

fn init_logging_simple() {
    // Minimal logging for CLI commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
