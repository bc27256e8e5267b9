use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};

use crate::config::StrategyMode;
use crate::strategy::{ImpliedProbabilityModel, MarketDiscovery, PriceToBeatSource};

#[derive(Parser)]
#[command(name = "updown")]
#[command(version = "0.1.0")]
#[command(about = "Up/down prediction market window trader", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Directory holding default.toml and environment overrides
    #[arg(short, long, default_value = "config", env = "UPDOWN_CONFIG_DIR")]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the trading engine
    Run {
        /// Strategy mode: single or arbitrage
        #[arg(long)]
        mode: Option<StrategyMode>,
        /// Trade against the paper exchange
        #[arg(long)]
        dry_run: bool,
        /// Emit logs as JSON
        #[arg(long)]
        json_logs: bool,
    },
    /// Show the window that is live now and its price to beat
    Current,
    /// Print implied probability of UP for a reference deviation across time remaining
    Implied {
        /// Deviation from the open, in percent (e.g. 0.3)
        #[arg(allow_hyphen_values = true)]
        deviation_pct: f64,
        /// Override the configured base steepness
        #[arg(long)]
        steepness: Option<f64>,
    },
}

const IMPLIED_TABLE_SECS: [f64; 10] = [
    600.0, 300.0, 250.0, 120.0, 60.0, 30.0, 20.0, 10.0, 5.0, 1.0,
];

pub async fn show_current_window(
    discovery: &dyn MarketDiscovery,
    prices: &dyn PriceToBeatSource,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let window = discovery
        .current_window(now)
        .await
        .context("market discovery failed")?;
    let Some(window) = window else {
        println!("No live window right now.");
        return Ok(());
    };

    println!("\x1b[36m{}\x1b[0m", window.title);
    println!("  Slug:      {}", window.id);
    println!("  Start:     {}", window.start_time);
    println!("  End:       {}", window.end_time);
    println!("  Remaining: {:.0}s", window.seconds_remaining_at(now));
    println!("  UP token:  {}", window.up_token_id);
    println!("  DOWN token:{}", window.down_token_id);
    if let Some((up, down)) = window.initial_odds {
        println!("  Odds:      up {} / down {}", up, down);
    }

    match prices.price_to_beat(&window).await {
        Ok(Some(price)) => println!("  Price to beat: {}", price),
        Ok(None) => println!("  Price to beat: not published yet"),
        Err(e) => println!("  Price to beat: lookup failed ({})", e),
    }
    Ok(())
}

pub fn implied_table(model: &ImpliedProbabilityModel, deviation_pct: f64) -> Vec<(f64, f64, f64)> {
    IMPLIED_TABLE_SECS
        .iter()
        .map(|&secs| {
            (
                secs,
                model.steepness_at(secs),
                model.p_up_for_deviation(deviation_pct, secs),
            )
        })
        .collect()
}

pub fn print_implied_table(
    model: &ImpliedProbabilityModel,
    deviation_pct: f64,
) -> anyhow::Result<()> {
    if !deviation_pct.is_finite() {
        bail!("deviation must be a finite percentage, got {}", deviation_pct);
    }

    println!("Deviation {:+.3}% from open", deviation_pct);
    println!("{:>10}  {:>9}  {:>7}  {:>7}", "remaining", "steepness", "P(up)", "P(down)");
    for (secs, k, p_up) in implied_table(model, deviation_pct) {
        println!(
            "{:>9.0}s  {:>9.2}  {:>7.4}  {:>7.4}",
            secs,
            k,
            p_up,
            1.0 - p_up
        );
    }
    Ok(())
}
