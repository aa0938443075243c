//! Polymarket Copy-Trading Bot
//!
//! Mirrors one trader's activity proportionally to the copier's own
//! capital: trades, splits, merges and redemptions.

mod api;
mod bot;
mod models;
mod trading;

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::api::{
    ChainExecutor, ClobClient, ClobCredentials, DataClient, DryRunExecutor, OrderSubmitter,
    PolygonClient, RelayerClient, RelayerCredentials, CLOB_URL, RELAYER_URL,
};
use crate::bot::{Bot, BotConfig, Feeds};
use crate::trading::{CopyConfig, Executors, RefreshSchedule};

/// Polymarket copy-trading bot CLI.
#[derive(Parser)]
#[command(name = "polymirror")]
#[command(about = "Mirror a Polymarket trader proportionally", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Also append logs to this file; empty disables file logging
    #[arg(long, env = "LOG_FILE", default_value = "bot.log")]
    log_file: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start mirroring the target trader
    Run(RunArgs),

    /// Show current configuration
    Config,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Trader to copy
    #[arg(long, env = "TARGET_TRADER_ADDRESS")]
    target: String,

    /// Copier proxy wallet (holds the funds)
    #[arg(long, env = "POLYMARKET_PROXY_ADDRESS")]
    proxy: String,

    /// Signer private key
    #[arg(long, env = "POLYMARKET_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    #[arg(long, env = "CLOB_HOST", default_value = CLOB_URL)]
    clob_host: String,

    #[arg(long, env = "CLOB_API_KEY", hide_env_values = true)]
    clob_api_key: Option<String>,

    #[arg(long, env = "CLOB_SECRET", hide_env_values = true)]
    clob_secret: Option<String>,

    #[arg(long, env = "CLOB_PASS_PHRASE", hide_env_values = true)]
    clob_pass_phrase: Option<String>,

    /// Polygon chain ID
    #[arg(long, env = "CHAIN_ID", default_value_t = 137)]
    chain_id: u64,

    /// 0 = EOA, 1 = email/magic proxy, 2 = browser proxy
    #[arg(long, env = "SIGNATURE_TYPE", default_value_t = 2)]
    signature_type: u8,

    #[arg(long, env = "RELAYER_URL", default_value = RELAYER_URL)]
    relayer_url: String,

    #[arg(long, env = "BUILDER_API_KEY", hide_env_values = true)]
    builder_api_key: Option<String>,

    #[arg(long, env = "BUILDER_SECRET", hide_env_values = true)]
    builder_secret: Option<String>,

    #[arg(long, env = "BUILDER_PASS_PHRASE", hide_env_values = true)]
    builder_pass_phrase: Option<String>,

    #[arg(long, env = "RPC_URL", default_value = "https://polygon-rpc.com")]
    rpc_url: String,

    /// Seconds between activity polls (fractions allowed)
    #[arg(long, env = "POLL_INTERVAL", default_value = "1", value_parser = parse_seconds)]
    poll_interval: Duration,

    /// Seconds between poller heartbeats
    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value_t = 60)]
    heartbeat_secs: u64,

    /// Seconds between copier position refreshes
    #[arg(long, env = "COPIER_REFRESH_INTERVAL", default_value_t = 1)]
    copier_refresh_secs: u64,

    /// Seconds between target position refreshes
    #[arg(long, env = "TARGET_REFRESH_INTERVAL", default_value_t = 60)]
    target_refresh_secs: u64,

    /// Seconds between USDC balance refreshes
    #[arg(long, env = "BALANCE_REFRESH_INTERVAL", default_value_t = 60)]
    balance_refresh_secs: u64,

    /// Buffered events between poller and engine
    #[arg(long, env = "CHANNEL_CAPACITY", default_value_t = 1024)]
    channel_capacity: usize,

    /// Log actions instead of sending them
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Dropping the guard flushes the file writer
    let _log_guard = init_logging(&cli.log_level, &cli.log_file)?;

    match cli.command {
        Commands::Run(args) => {
            let copy_config = CopyConfig::default();
            let config = bot_config(&args, copy_config.clone());

            let data = Arc::new(
                DataClient::new()?
                    .with_timeouts(
                        Duration::from_secs(copy_config.activity_timeout_secs),
                        Duration::from_secs(copy_config.positions_timeout_secs),
                    )
                    .with_positions_paging(
                        copy_config.positions_page_size,
                        copy_config.positions_size_threshold,
                    ),
            );
            let polygon = Arc::new(PolygonClient::new(args.rpc_url.clone())?);

            let (orders, chain) = if args.dry_run {
                info!("Dry run: actions will be logged, not sent");
                let dry_run = Arc::new(DryRunExecutor::new());
                let orders: Arc<dyn OrderSubmitter> = dry_run.clone();
                let chain: Arc<dyn ChainExecutor> = dry_run;
                (orders, chain)
            } else {
                live_executors(&args).await?
            };

            let bot = Bot::new(
                config,
                Feeds {
                    activity: data.clone(),
                    positions: data.clone(),
                    balance: polygon,
                },
                Executors {
                    orders,
                    chain,
                    resolver: data,
                },
            );

            let stats = bot.run().await?;
            println!("\n{}", stats);
        }

        Commands::Config => {
            let config = CopyConfig::default();
            let defaults = BotConfig::default();

            println!("\n=== Copy Configuration ===\n");
            println!("Sizing:");
            println!("  Min Market Order:     ${}", config.min_market_order);
            println!("  Limit Price Ceiling:  {}", config.limit_price_ceiling);
            println!("  Min Limit Shares:     {}", config.min_limit_shares);

            println!("\nFeeds:");
            println!("  Activity Page Size:   {}", config.activity_page_size);
            println!("  Activity Timeout:     {}s", config.activity_timeout_secs);
            println!("  Positions Page Size:  {}", config.positions_page_size);
            println!("  Positions Threshold:  {}", config.positions_size_threshold);
            println!("  Positions Timeout:    {}s", config.positions_timeout_secs);

            println!("\nSchedule:");
            println!("  Poll Interval:        {:?}", defaults.poll_interval);
            println!("  Heartbeat:            {:?}", defaults.heartbeat_interval);
            println!("  Copier Refresh:       {:?}", defaults.copier_refresh.positions);
            println!("  Target Refresh:       {:?}", defaults.target_refresh.positions);
            println!("  Balance Refresh:      {:?}", defaults.copier_refresh.balance);
            println!("  Channel Capacity:     {}", defaults.channel_capacity);
        }
    }

    Ok(())
}

fn bot_config(args: &RunArgs, copy_config: CopyConfig) -> BotConfig {
    let balance = Duration::from_secs(args.balance_refresh_secs);
    BotConfig {
        target_address: args.target.clone(),
        copier_address: args.proxy.clone(),
        poll_interval: args.poll_interval,
        heartbeat_interval: Duration::from_secs(args.heartbeat_secs.max(1)),
        copier_refresh: RefreshSchedule {
            positions: Duration::from_secs(args.copier_refresh_secs.max(1)),
            balance: balance.max(Duration::from_secs(1)),
        },
        target_refresh: RefreshSchedule {
            positions: Duration::from_secs(args.target_refresh_secs.max(1)),
            balance: balance.max(Duration::from_secs(1)),
        },
        channel_capacity: args.channel_capacity,
        dry_run: args.dry_run,
        copy_config,
    }
}

/// Console output plus an optional non-blocking file writer.
fn init_logging(level: &str, log_file: &str) -> Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()));

    let (file_layer, guard) = match file_writer(log_file) {
        Some((writer, guard)) => (
            Some(fmt::layer().with_writer(writer).with_ansi(false).with_target(false)),
            Some(guard),
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()?;

    if guard.is_some() {
        info!(path = %log_file, "Logging to file");
    }
    Ok(guard)
}

fn file_writer(log_file: &str) -> Option<(NonBlocking, WorkerGuard)> {
    if log_file.is_empty() {
        return None;
    }
    let path = Path::new(log_file);
    // The appender panics if it cannot open the file, so check first
    if let Err(e) = OpenOptions::new().create(true).append(true).open(path) {
        eprintln!("Warning: cannot open log file {} ({}), file logging disabled", log_file, e);
        return None;
    }
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path.file_name()?;
    Some(tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name)))
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("invalid number of seconds: {}", value))?;
    match Duration::try_from_secs_f64(secs) {
        Ok(d) if !d.is_zero() => Ok(d),
        _ => Err(format!("interval must be a positive number of seconds: {}", value)),
    }
}

/// L2 credentials from the environment, if all three are set.
fn env_credentials(args: &RunArgs) -> Option<ClobCredentials> {
    Some(ClobCredentials {
        api_key: required(&args.clob_api_key, "CLOB_API_KEY").ok()?,
        api_secret: required(&args.clob_secret, "CLOB_SECRET").ok()?,
        api_passphrase: required(&args.clob_pass_phrase, "CLOB_PASS_PHRASE").ok()?,
    })
}

async fn live_executors(
    args: &RunArgs,
) -> Result<(Arc<dyn OrderSubmitter>, Arc<dyn ChainExecutor>)> {
    let private_key = args
        .private_key
        .as_deref()
        .context("POLYMARKET_PRIVATE_KEY is required unless --dry-run is set")?;

    let mut clob = ClobClient::new(
        &args.clob_host,
        private_key,
        Some(&args.proxy),
        args.signature_type,
        env_credentials(args),
        args.chain_id,
    )?;
    if !clob.has_credentials() {
        warn!("CLOB API credentials not configured, deriving from private key");
        clob.create_or_derive_credentials().await?;
    }
    info!(address = ?clob.address(), "CLOB client initialized");

    let relayer_credentials = RelayerCredentials {
        api_key: required(&args.builder_api_key, "BUILDER_API_KEY")?,
        secret: required(&args.builder_secret, "BUILDER_SECRET")?,
        passphrase: required(&args.builder_pass_phrase, "BUILDER_PASS_PHRASE")?,
    };
    let relayer = RelayerClient::new(
        &args.relayer_url,
        private_key,
        &args.proxy,
        relayer_credentials,
        args.chain_id,
    )?;

    let orders: Arc<dyn OrderSubmitter> = Arc::new(clob);
    let chain: Arc<dyn ChainExecutor> = Arc::new(relayer);
    Ok((orders, chain))
}

fn required(value: &Option<String>, name: &str) -> Result<String> {
    value
        .clone()
        .filter(|v| !v.is_empty())
        .with_context(|| format!("{} is required for live trading", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_defaults() {
        let cli = Cli::try_parse_from([
            "polymirror",
            "run",
            "--target",
            "0x1111111111111111111111111111111111111111",
            "--proxy",
            "0x2222222222222222222222222222222222222222",
            "--dry-run",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(cli.log_file, "bot.log");
        assert!(env_credentials(&args).is_none());

        let config = bot_config(&args, CopyConfig::default());
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.copier_refresh.positions, Duration::from_secs(1));
        assert_eq!(config.target_refresh.positions, Duration::from_secs(60));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(60));
        assert!(config.dry_run);
    }

    #[test]
    fn test_poll_interval_in_seconds() {
        assert_eq!(parse_seconds("0.5").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_seconds("2").unwrap(), Duration::from_secs(2));
        assert!(parse_seconds("0").is_err());
        assert!(parse_seconds("-1").is_err());
        assert!(parse_seconds("soon").is_err());
    }

    #[test]
    fn test_env_credentials_need_all_three() {
        let cli = Cli::try_parse_from([
            "polymirror",
            "run",
            "--target",
            "0x1111111111111111111111111111111111111111",
            "--proxy",
            "0x2222222222222222222222222222222222222222",
            "--clob-api-key",
            "key",
            "--clob-secret",
            "secret",
        ])
        .unwrap();
        let Commands::Run(mut args) = cli.command else {
            panic!("expected run");
        };
        assert!(env_credentials(&args).is_none());

        args.clob_pass_phrase = Some("pass".to_string());
        let credentials = env_credentials(&args).unwrap();
        assert_eq!(credentials.api_key, "key");
        assert_eq!(credentials.api_passphrase, "pass");
    }

    #[test]
    fn test_file_writer() {
        assert!(file_writer("").is_none());
        assert!(file_writer("/nonexistent-dir/bot.log").is_none());

        let path = std::env::temp_dir().join("polymirror-test.log");
        assert!(file_writer(path.to_str().unwrap()).is_some());
        assert!(path.exists());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_missing_credentials_fail_live_mode() {
        assert!(required(&None, "CLOB_API_KEY").is_err());
        assert!(required(&Some(String::new()), "CLOB_API_KEY").is_err());
        assert_eq!(required(&Some("k".into()), "CLOB_API_KEY").unwrap(), "k");
    }
}
