//! Bot runner: wires the poller, ledgers and copy engine together.
//!
//! Handles:
//! - Seeding and refreshing the copier and target ledgers
//! - Running the activity poller and its heartbeat
//! - Feeding merged events to the copy engine
//! - Graceful shutdown on Ctrl-C / SIGTERM with final statistics

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::{ActivityFeed, BalanceSource, PositionsFeed};
use crate::trading::{
    spawn_heartbeat, ActivityPoller, CopyConfig, CopyEngine, EngineStats, Executors,
    HealthSnapshot, PollerHealth, PositionLedger, RefreshSchedule, WalletTracker,
};

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Wallet being mirrored
    pub target_address: String,

    /// Wallet placing the mirrored trades
    pub copier_address: String,

    /// Activity polling interval
    pub poll_interval: Duration,

    /// Interval between poller heartbeat lines
    pub heartbeat_interval: Duration,

    /// Refresh cadence for the copier's own ledger
    pub copier_refresh: RefreshSchedule,

    /// Refresh cadence for the target's shadow ledger
    pub target_refresh: RefreshSchedule,

    /// Buffer size of the poller to engine channel
    pub channel_capacity: usize,

    /// Whether actions are only logged
    pub dry_run: bool,

    /// Sizing policy
    pub copy_config: CopyConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            target_address: String::new(),
            copier_address: String::new(),
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(60),
            copier_refresh: RefreshSchedule {
                positions: Duration::from_secs(1),
                balance: Duration::from_secs(60),
            },
            target_refresh: RefreshSchedule {
                positions: Duration::from_secs(60),
                balance: Duration::from_secs(60),
            },
            channel_capacity: 1024,
            dry_run: true,
            copy_config: CopyConfig::default(),
        }
    }
}

/// Read-side collaborators.
#[derive(Clone)]
pub struct Feeds {
    pub activity: Arc<dyn ActivityFeed>,
    pub positions: Arc<dyn PositionsFeed>,
    pub balance: Arc<dyn BalanceSource>,
}

/// Main bot runner.
pub struct Bot {
    config: BotConfig,
    feeds: Feeds,
    copier: Arc<PositionLedger>,
    target: Arc<PositionLedger>,
    engine: Arc<CopyEngine>,
    shutdown: watch::Sender<bool>,
}

impl Bot {
    pub fn new(config: BotConfig, feeds: Feeds, executors: Executors) -> Self {
        let copier = Arc::new(PositionLedger::new(config.copier_address.clone()));
        let target = Arc::new(PositionLedger::new(config.target_address.clone()));
        let engine = Arc::new(CopyEngine::new(
            config.copy_config.clone(),
            copier.clone(),
            target.clone(),
            executors,
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            feeds,
            copier,
            target,
            engine,
            shutdown,
        }
    }

    /// Run until Ctrl-C or SIGTERM.
    pub async fn run(&self) -> Result<BotStats> {
        self.run_until(async {
            if let Err(e) = wait_for_signal().await {
                error!(error = %e, "Failed to listen for shutdown signals");
            }
        })
        .await
    }

    /// Run until `stop` resolves or the engine exits on its own.
    pub async fn run_until<F>(&self, stop: F) -> Result<BotStats>
    where
        F: Future<Output = ()>,
    {
        info!(
            target_wallet = %self.config.target_address,
            copier_wallet = %self.config.copier_address,
            dry_run = self.config.dry_run,
            "Starting copy-trading bot"
        );

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let copier_tracker = Arc::new(self.tracker(self.copier.clone()));
        let target_tracker = Arc::new(self.tracker(self.target.clone()));
        let (copier_tasks, target_tasks) = tokio::join!(
            copier_tracker.start(self.config.copier_refresh, self.shutdown.subscribe()),
            target_tracker.start(self.config.target_refresh, self.shutdown.subscribe()),
        );
        tasks.extend(copier_tasks);
        tasks.extend(target_tasks);

        let poller = ActivityPoller::new(
            self.config.target_address.clone(),
            self.feeds.activity.clone(),
            self.config.copy_config.activity_page_size,
            self.config.poll_interval,
        );
        let health = poller.health();
        tasks.push(spawn_heartbeat(
            health.clone(),
            self.config.heartbeat_interval,
            self.shutdown.subscribe(),
        ));
        tasks.push(tokio::spawn(poller.run(tx, self.shutdown.subscribe())));

        let engine = self.engine.clone();
        let engine_shutdown = self.shutdown.subscribe();
        let mut engine_task = tokio::spawn(async move { engine.run(rx, engine_shutdown).await });

        info!("Bot running (poller + engine)");

        let finished = tokio::select! {
            _ = stop => {
                info!("Shutdown signal received");
                None
            }
            joined = &mut engine_task => Some(joined),
        };

        info!("Shutting down bot");
        self.shutdown.send_replace(true);

        let joined = match finished {
            Some(joined) => joined,
            None => engine_task.await,
        };
        let engine_error = match joined {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(format!("engine task panicked: {}", e)),
        };

        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let stats = self.stats(&health, engine_error).await;
        info!("Bot stopped");
        Ok(stats)
    }

    fn tracker(&self, ledger: Arc<PositionLedger>) -> WalletTracker {
        WalletTracker::new(
            ledger,
            self.feeds.positions.clone(),
            self.feeds.balance.clone(),
        )
    }

    async fn stats(&self, health: &PollerHealth, engine_error: Option<String>) -> BotStats {
        BotStats {
            poller: health.snapshot().await,
            engine: self.engine.stats(),
            engine_error,
            copier_markets: self.copier.market_count().await,
            copier_cash: self.copier.cash().await,
            target_markets: self.target.market_count().await,
            target_cash: self.target.cash().await,
            dry_run: self.config.dry_run,
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Bot statistics.
#[derive(Debug, Clone)]
pub struct BotStats {
    pub poller: HealthSnapshot,
    pub engine: EngineStats,
    pub engine_error: Option<String>,
    pub copier_markets: usize,
    pub copier_cash: Decimal,
    pub target_markets: usize,
    pub target_cash: Decimal,
    pub dry_run: bool,
}

impl std::fmt::Display for BotStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Bot Statistics ===")?;
        writeln!(f, "Poller:          {} (last poll {:.3}s ago)",
            if self.poller.running { "Running" } else { "Stopped" },
            self.poller.seconds_since_last_poll)?;
        writeln!(f, "Activities:      {} (Timeouts: {}, Out of order: {})",
            self.poller.events, self.poller.timeouts, self.poller.ordering_violations)?;
        writeln!(f, "Copies:          {} (Skipped: {}, Failed: {})",
            self.engine.copied, self.engine.skipped, self.engine.failed)?;
        if let Some(ref e) = self.engine_error {
            writeln!(f, "Engine Error:    {}", e)?;
        }
        writeln!(f, "Copier Wallet:   {} markets, ${:.2}", self.copier_markets, self.copier_cash)?;
        writeln!(f, "Target Wallet:   {} markets, ${:.2}", self.target_markets, self.target_cash)?;
        writeln!(f, "Mode:            {}", if self.dry_run { "Dry Run" } else { "Live" })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::testing::{
        buy, MockActivityFeed, MockBalances, MockPositions, RecordingExecutor, StaticResolver,
    };
    use crate::models::{CopyAction, OrderSizing};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[tokio::test(start_paused = true)]
    async fn test_event_flows_from_feed_to_executor() {
        let activity = Arc::new(MockActivityFeed::default());
        let ahead = Utc::now().timestamp() + 1_000;
        activity.push_page(vec![buy("m", "yes", dec!(40), dec!(20), ahead)]).await;

        let positions = Arc::new(MockPositions::default());
        let balances = Arc::new(MockBalances::default());
        balances.set("0xcopier", dec!(100)).await;
        balances.set("0xtarget", dec!(1000)).await;

        let executor = Arc::new(RecordingExecutor::default());
        let config = BotConfig {
            target_address: "0xtarget".to_string(),
            copier_address: "0xcopier".to_string(),
            ..BotConfig::default()
        };
        let bot = Bot::new(
            config,
            Feeds {
                activity,
                positions,
                balance: balances,
            },
            Executors {
                orders: executor.clone(),
                chain: executor.clone(),
                resolver: Arc::new(StaticResolver::default()),
            },
        );

        let stats = bot
            .run_until(tokio::time::sleep(Duration::from_secs(5)))
            .await
            .unwrap();

        let actions = executor.actions().await;
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            CopyAction::Order(order) => {
                assert_eq!(order.sizing, OrderSizing::Market { amount: dec!(2) })
            }
            other => panic!("expected an order, got {:?}", other),
        }
        assert_eq!(stats.engine.copied, 1);
        assert_eq!(stats.poller.events, 1);
        assert!(!stats.poller.running);
        assert!(!stats.engine.running);
        assert_eq!(stats.target_markets, 1);
        assert_eq!(stats.copier_cash, dec!(100));
        assert!(stats.engine_error.is_none());
    }

    #[test]
    fn test_stats_display() {
        let stats = BotStats {
            poller: HealthSnapshot {
                running: false,
                seconds_since_last_poll: 0.5,
                timeouts: 2,
                events: 7,
                ordering_violations: 0,
            },
            engine: EngineStats {
                running: false,
                copied: 5,
                skipped: 2,
                failed: 0,
            },
            engine_error: None,
            copier_markets: 3,
            copier_cash: dec!(12.5),
            target_markets: 9,
            target_cash: dec!(1500),
            dry_run: true,
        };
        let text = stats.to_string();
        assert!(text.contains("Copies:          5 (Skipped: 2, Failed: 0)"));
        assert!(text.contains("Copier Wallet:   3 markets, $12.50"));
        assert!(text.contains("Dry Run"));
    }
}
