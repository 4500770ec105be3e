//! gridai - main entry point
//!
//! Three subcommands:
//! - paper: simulated placements against real market data
//! - live: real placements (requires API credentials via env)
//! - backtest: historical simulation from CSV or fetched candles

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

use commands::run::Mode;

#[derive(Parser, Debug)]
#[command(name = "gridai")]
#[command(about = "Regime-aware grid market-making engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration profile name
    #[arg(long, global = true, default_value = "default")]
    profile: String,

    /// Directory holding the layered config profiles
    #[arg(long = "config-dir", global = true, default_value = "config")]
    config_dir: String,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run paper trading (simulated placements, real market data)
    Paper,

    /// Run live trading (CAUTION - REAL MONEY!)
    Live,

    /// Run a historical backtest
    Backtest {
        /// CSV file with OHLCV candles; fetched from the venue if omitted
        #[arg(long = "data-file")]
        data_file: Option<String>,

        /// Start date (YYYY-MM-DD)
        #[arg(long = "start-date")]
        start_date: Option<String>,

        /// End date (YYYY-MM-DD)
        #[arg(long = "end-date")]
        end_date: Option<String>,

        /// Write metrics JSON to this path
        #[arg(long)]
        output: Option<String>,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );

    let level = if verbose {
        "debug".to_string()
    } else {
        std::env::var("GRIDAI_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    // Human-readable console, structured JSON to the log file
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(true);
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_appender)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(log_file = %format!("logs/{log_filename}"), "logging initialized");
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Paper => "paper",
        Commands::Live => "live",
        Commands::Backtest { .. } => "backtest",
    };

    if let Err(e) = setup_logging(cli.verbose, command_name) {
        eprintln!("failed to set up logging: {e:#}");
        std::process::exit(1);
    }

    let result = match cli.command {
        Commands::Paper => commands::run::run(Mode::Paper, &cli.profile, &cli.config_dir),
        Commands::Live => commands::run::run(Mode::Live, &cli.profile, &cli.config_dir),
        Commands::Backtest {
            data_file,
            start_date,
            end_date,
            output,
        } => commands::backtest::run(
            &cli.profile,
            &cli.config_dir,
            data_file,
            start_date,
            end_date,
            output,
        ),
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };
    std::process::exit(code);
}
