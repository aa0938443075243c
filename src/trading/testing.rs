//! In-memory collaborators for exercising the pipeline without a network.

use std::collections::{HashMap, VecDeque};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::api::{
    ActivityFeed, BalanceSource, ChainExecutor, FeedError, OrderSubmitter, PositionRecord,
    PositionsFeed, SubmissionReceipt, TokenResolver,
};
use crate::models::{
    ActivityEvent, ActivityKind, ChainOperation, CopyAction, OrderIntent, TradeSide,
};

pub fn event(
    kind: ActivityKind,
    side: Option<TradeSide>,
    market: &str,
    outcome: &str,
    shares: Decimal,
    cash: Decimal,
    observed_at: i64,
) -> ActivityEvent {
    let price = if shares.is_zero() { Decimal::ZERO } else { cash / shares };
    ActivityEvent {
        kind,
        side,
        market_id: market.to_string(),
        outcome_id: outcome.to_string(),
        share_size: shares,
        cash_size: cash,
        price,
        observed_at,
        label: format!("{} {}", kind.as_str(), market),
    }
}

pub fn buy(market: &str, outcome: &str, shares: Decimal, cash: Decimal, ts: i64) -> ActivityEvent {
    event(ActivityKind::Trade, Some(TradeSide::Buy), market, outcome, shares, cash, ts)
}

pub fn sell(market: &str, outcome: &str, shares: Decimal, cash: Decimal, ts: i64) -> ActivityEvent {
    event(ActivityKind::Trade, Some(TradeSide::Sell), market, outcome, shares, cash, ts)
}

/// Serves queued pages in order, then empty pages.
#[derive(Default)]
pub struct MockActivityFeed {
    pages: Mutex<VecDeque<std::result::Result<Vec<ActivityEvent>, FeedError>>>,
}

impl MockActivityFeed {
    pub async fn push_page(&self, page: Vec<ActivityEvent>) {
        self.pages.lock().await.push_back(Ok(page));
    }

    pub async fn push_error(&self, error: FeedError) {
        self.pages.lock().await.push_back(Err(error));
    }
}

#[async_trait]
impl ActivityFeed for MockActivityFeed {
    async fn recent_activity(
        &self,
        _address: &str,
        _limit: u32,
    ) -> std::result::Result<Vec<ActivityEvent>, FeedError> {
        self.pages.lock().await.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[derive(Default)]
pub struct MockPositions {
    by_address: Mutex<HashMap<String, Vec<PositionRecord>>>,
    failing: Mutex<bool>,
}

impl MockPositions {
    pub async fn set(&self, address: &str, records: Vec<PositionRecord>) {
        self.by_address.lock().await.insert(address.to_string(), records);
    }

    pub async fn fail(&self, failing: bool) {
        *self.failing.lock().await = failing;
    }
}

#[async_trait]
impl PositionsFeed for MockPositions {
    async fn positions(&self, address: &str) -> Result<Vec<PositionRecord>> {
        if *self.failing.lock().await {
            return Err(anyhow!("positions feed unavailable"));
        }
        Ok(self.by_address.lock().await.get(address).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct MockBalances {
    by_address: Mutex<HashMap<String, Decimal>>,
    failing: Mutex<bool>,
}

impl MockBalances {
    pub async fn set(&self, address: &str, balance: Decimal) {
        self.by_address.lock().await.insert(address.to_string(), balance);
    }

    pub async fn fail(&self, failing: bool) {
        *self.failing.lock().await = failing;
    }
}

#[async_trait]
impl BalanceSource for MockBalances {
    async fn cash_balance(&self, address: &str) -> Result<Decimal> {
        if *self.failing.lock().await {
            return Err(anyhow!("rpc unavailable"));
        }
        Ok(self.by_address.lock().await.get(address).copied().unwrap_or(Decimal::ZERO))
    }
}

/// Resolves only the markets it was given.
#[derive(Default)]
pub struct StaticResolver {
    markets: HashMap<String, Vec<String>>,
}

impl StaticResolver {
    pub fn with_market(mut self, market: &str, outcomes: &[&str]) -> Self {
        self.markets.insert(
            market.to_string(),
            outcomes.iter().map(|o| o.to_string()).collect(),
        );
        self
    }
}

#[async_trait]
impl TokenResolver for StaticResolver {
    async fn outcome_ids(&self, market_id: &str) -> Result<Vec<String>> {
        self.markets
            .get(market_id)
            .cloned()
            .ok_or_else(|| anyhow!("No market found for condition {}", market_id))
    }
}

/// Records every action it receives; optionally rejects them all.
#[derive(Default)]
pub struct RecordingExecutor {
    actions: Mutex<Vec<CopyAction>>,
    reject: bool,
}

impl RecordingExecutor {
    pub fn rejecting() -> Self {
        Self {
            actions: Mutex::new(Vec::new()),
            reject: true,
        }
    }

    pub async fn actions(&self) -> Vec<CopyAction> {
        self.actions.lock().await.clone()
    }

    async fn record(&self, action: CopyAction) -> SubmissionReceipt {
        self.actions.lock().await.push(action);
        if self.reject {
            SubmissionReceipt::rejected("not enough balance / allowance")
        } else {
            SubmissionReceipt::accepted(Some("0xreceipt".to_string()))
        }
    }
}

#[async_trait]
impl OrderSubmitter for RecordingExecutor {
    async fn submit(&self, order: &OrderIntent) -> Result<SubmissionReceipt> {
        Ok(self.record(CopyAction::Order(order.clone())).await)
    }
}

#[async_trait]
impl ChainExecutor for RecordingExecutor {
    async fn execute(&self, operation: &ChainOperation) -> Result<SubmissionReceipt> {
        Ok(self.record(CopyAction::Chain(operation.clone())).await)
    }
}
