//! Polymarket API clients and the collaborator traits the core depends on.

mod auth;
mod clob_client;
mod data_client;
mod dry_run;
mod error;
mod polygon_client;
mod relayer_client;
mod types;

pub use clob_client::{ClobClient, ClobCredentials, CLOB_URL};
pub use data_client::DataClient;
pub use dry_run::DryRunExecutor;
pub use error::FeedError;
pub use polygon_client::PolygonClient;
pub use relayer_client::{RelayerClient, RelayerCredentials, RELAYER_URL};
pub use types::*;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::{ActivityEvent, ChainOperation, OrderIntent};

/// Paged read of an address's most recent activity, newest first.
#[async_trait]
pub trait ActivityFeed: Send + Sync {
    async fn recent_activity(
        &self,
        address: &str,
        limit: u32,
    ) -> std::result::Result<Vec<ActivityEvent>, FeedError>;
}

/// Full snapshot of an address's outcome holdings.
#[async_trait]
pub trait PositionsFeed: Send + Sync {
    async fn positions(&self, address: &str) -> Result<Vec<PositionRecord>>;
}

/// Point read of an address's USDC balance.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn cash_balance(&self, address: &str) -> Result<Decimal>;
}

/// Outcome token IDs belonging to a market.
#[async_trait]
pub trait TokenResolver: Send + Sync {
    async fn outcome_ids(&self, market_id: &str) -> Result<Vec<String>>;
}

/// Accepts sized trade intents for the order book.
#[async_trait]
pub trait OrderSubmitter: Send + Sync {
    async fn submit(&self, order: &OrderIntent) -> Result<SubmissionReceipt>;
}

/// Executes conditional-token operations and waits for confirmation.
#[async_trait]
pub trait ChainExecutor: Send + Sync {
    async fn execute(&self, operation: &ChainOperation) -> Result<SubmissionReceipt>;
}
