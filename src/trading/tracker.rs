//! Keeps a ledger in step with the positions feed and on-chain balance.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::{BalanceSource, PositionsFeed};

use super::PositionLedger;

/// Refresh cadence for one tracked wallet.
#[derive(Debug, Clone, Copy)]
pub struct RefreshSchedule {
    pub positions: Duration,
    pub balance: Duration,
}

/// Periodically resynchronizes a [`PositionLedger`] from its sources.
pub struct WalletTracker {
    ledger: Arc<PositionLedger>,
    positions: Arc<dyn PositionsFeed>,
    balance: Arc<dyn BalanceSource>,
}

impl WalletTracker {
    /// Create a tracker that keeps `ledger` in sync with the feeds.
    pub fn new(
        ledger: Arc<PositionLedger>,
        positions: Arc<dyn PositionsFeed>,
        balance: Arc<dyn BalanceSource>,
    ) -> Self {
        Self {
            ledger,
            positions,
            balance,
        }
    }

    #[cfg(test)]
    pub fn ledger(&self) -> Arc<PositionLedger> {
        self.ledger.clone()
    }

    /// Replace the positions map with a fresh snapshot.
    ///
    /// On error the previous snapshot stays in place.
    pub async fn refresh_positions(&self) -> Result<usize> {
        let address = self.ledger.address();
        let records = self
            .positions
            .positions(address)
            .await
            .with_context(|| format!("Failed to fetch positions for {}", address))?;
        Ok(self.ledger.replace_positions(records).await)
    }

    /// Overwrite the cash balance from the balance source.
    pub async fn refresh_balance(&self) -> Result<Decimal> {
        let address = self.ledger.address();
        let balance = self
            .balance
            .cash_balance(address)
            .await
            .with_context(|| format!("Failed to fetch balance for {}", address))?;
        self.ledger.set_cash(balance).await;
        Ok(balance)
    }

    /// Refresh positions and balance together.
    pub async fn refresh_all(&self) -> Result<()> {
        let (positions, balance) = tokio::join!(self.refresh_positions(), self.refresh_balance());
        positions?;
        balance?;
        Ok(())
    }

    /// Seed the ledger, then keep it fresh until `shutdown` fires.
    pub async fn start(
        self: Arc<Self>,
        schedule: RefreshSchedule,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        if let Err(e) = self.refresh_all().await {
            warn!(address = %self.ledger.address(), error = %e, "Initial wallet sync incomplete");
        }
        info!(
            address = %self.ledger.address(),
            markets = self.ledger.market_count().await,
            cash = %self.ledger.cash().await,
            "Wallet tracker ready"
        );

        let positions_task = {
            let tracker = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tracker.positions_loop(schedule.positions, shutdown).await;
            })
        };
        let balance_task = {
            let tracker = self.clone();
            tokio::spawn(async move {
                tracker.balance_loop(schedule.balance, shutdown).await;
            })
        };

        vec![positions_task, balance_task]
    }

    async fn positions_loop(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            match self.refresh_positions().await {
                Ok(markets) => {
                    debug!(address = %self.ledger.address(), markets, "Refreshed positions")
                }
                Err(e) => warn!(error = %e, "Positions refresh failed"),
            }
        }
    }

    async fn balance_loop(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            match self.refresh_balance().await {
                Ok(balance) => {
                    debug!(address = %self.ledger.address(), balance = %balance, "Refreshed balance")
                }
                Err(e) => warn!(error = %e, "Balance refresh failed"),
            }
        }
    }
}
