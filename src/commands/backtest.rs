//! Backtest command
//!
//! Drives the backtest engine over historical candles from a CSV file
//! or, when no file is given, recent history fetched from the venue.
//! No order endpoints are touched.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::info;

use gridai::backtest::BacktestEngine;
use gridai::config::ConfigLoader;
use gridai::data;
use gridai::venue::RestVenue;

pub fn run(
    profile: &str,
    config_dir: &str,
    data_file: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    output: Option<String>,
) -> Result<i32> {
    dotenv::dotenv().ok();

    let config = ConfigLoader::new(config_dir, profile)
        .load()
        .context("failed to load configuration")?;

    let start = parse_date(start_date.as_deref())?;
    let end = parse_date(end_date.as_deref())?;

    let candles = match &data_file {
        Some(path) => {
            info!(path, "loading historical data");
            data::load_csv(path)?
        }
        None => {
            info!("no data file given, fetching recent history from venue");
            let venue = RestVenue::new(&config.exchange);
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to build tokio runtime")?;
            runtime.block_on(data::fetch_from_venue(&venue, "5m", 1000))?
        }
    };
    let candles = data::filter_date_range(candles, start, end);
    if candles.is_empty() {
        anyhow::bail!("no candles in the selected date range");
    }

    let initial_capital = config.paper.initial_capital_usdt;
    let mut engine = BacktestEngine::new(&config, initial_capital);
    let report = engine.run(&candles);
    let metrics = &report.metrics;

    println!("\n{}", "=".repeat(60));
    println!("BACKTEST RESULTS");
    println!("{}", "=".repeat(60));
    println!("Initial Capital:    ${:.2}", metrics.initial_capital);
    println!("Final Equity:       ${:.2}", metrics.final_equity);
    println!(
        "Total Return:       ${:.2} ({:.2}%)",
        metrics.total_return_usdt, metrics.total_return_pct
    );
    println!("Max Drawdown:       {:.2}%", metrics.max_drawdown_pct);
    println!("Sharpe Ratio:       {:.2}", metrics.sharpe_ratio);
    println!("Sortino Ratio:      {:.2}", metrics.sortino_ratio);
    println!("Calmar Ratio:       {:.2}", metrics.calmar_ratio);
    println!("Win Rate:           {:.2}%", metrics.win_rate_pct);
    println!("Profit Factor:      {:.2}", metrics.profit_factor);
    println!("Total Trades:       {}", metrics.total_trades);
    println!("Total Fees:         ${:.2}", metrics.total_fees_usdt);
    if report.emergency_stopped {
        println!("NOTE: run ended early on an emergency stop");
    }
    println!("{}", "=".repeat(60));

    if let Some(output_path) = output {
        let json = serde_json::to_string_pretty(metrics)?;
        std::fs::write(&output_path, json)
            .with_context(|| format!("failed to write {output_path}"))?;
        info!(path = %output_path, "metrics written");
    }

    Ok(0)
}

fn parse_date(s: Option<&str>) -> Result<Option<NaiveDate>> {
    s.map(|raw| {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .with_context(|| format!("invalid date (expected YYYY-MM-DD): {raw}"))
    })
    .transpose()
}
