//! Polymarket Data API client for activity, positions and market token lookups.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::models::ActivityEvent;

use super::error::FeedError;
use super::types::*;
use super::{ActivityFeed, PositionsFeed, TokenResolver};

const DATA_API_BASE: &str = "https://data-api.polymarket.com";
const GAMMA_API_BASE: &str = "https://gamma-api.polymarket.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const ACTIVITY_TIMEOUT: Duration = Duration::from_secs(5);
const POSITIONS_TIMEOUT: Duration = Duration::from_secs(10);
const POSITIONS_PAGE_SIZE: u32 = 500;

/// Client for Polymarket Data API (read-only operations).
pub struct DataClient {
    client: Client,
    base_url: String,
    gamma_url: String,
    activity_timeout: Duration,
    positions_timeout: Duration,
    positions_page_size: u32,
    size_threshold: Decimal,
}

impl DataClient {
    /// Create a new data client with default settings.
    pub fn new() -> Result<Self> {
        Self::with_base_urls(DATA_API_BASE.to_string(), GAMMA_API_BASE.to_string())
    }

    /// Create with custom base URLs (for testing).
    pub fn with_base_urls(base_url: String, gamma_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            gamma_url,
            activity_timeout: ACTIVITY_TIMEOUT,
            positions_timeout: POSITIONS_TIMEOUT,
            positions_page_size: POSITIONS_PAGE_SIZE,
            size_threshold: dec!(0.1),
        })
    }

    pub fn with_timeouts(mut self, activity: Duration, positions: Duration) -> Self {
        self.activity_timeout = activity;
        self.positions_timeout = positions;
        self
    }

    pub fn with_positions_paging(mut self, page_size: u32, size_threshold: Decimal) -> Self {
        self.positions_page_size = page_size.clamp(1, 500);
        self.size_threshold = size_threshold;
        self
    }

    /// Fetch one page of activity, newest first.
    pub async fn get_activity(
        &self,
        address: &str,
        limit: u32,
    ) -> std::result::Result<Vec<ActivityResponse>, FeedError> {
        let url = format!("{}/activity", self.base_url);
        let params = ActivityParams {
            user: address,
            limit: limit.min(500),
            sort_by: "TIMESTAMP",
            sort_direction: "DESC",
        };

        debug!(url = %url, user = %address, limit = params.limit, "Fetching activity");

        let response = self
            .client
            .get(&url)
            .query(&params)
            .timeout(self.activity_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::Status { status, body });
        }

        Ok(response.json().await?)
    }

    /// Fetch every position for an address, one page at a time.
    pub async fn get_all_positions(&self, address: &str) -> Result<Vec<PositionResponse>> {
        let url = format!("{}/positions", self.base_url);
        let mut offset = 0u32;
        let mut positions = Vec::new();

        loop {
            let params = PositionsParams {
                user: address,
                size_threshold: self.size_threshold,
                limit: self.positions_page_size,
                offset,
            };

            debug!(url = %url, user = %address, offset = offset, "Fetching positions");

            let response = self
                .client
                .get(&url)
                .query(&params)
                .timeout(self.positions_timeout)
                .send()
                .await
                .context("Failed to fetch positions")?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("Positions request failed: {} - {}", status, body);
            }

            let page: Vec<PositionResponse> = response
                .json()
                .await
                .context("Failed to parse positions response")?;

            let page_len = page.len() as u32;
            positions.extend(page);

            if page_len < self.positions_page_size {
                break;
            }
            offset += self.positions_page_size;
        }

        Ok(positions)
    }

    /// Look up the outcome token IDs of a market.
    pub async fn get_market_token_ids(&self, condition_id: &str) -> Result<Vec<String>> {
        let url = format!("{}/markets", self.gamma_url);

        debug!(url = %url, market = %condition_id, "Fetching market tokens");

        let response = self
            .client
            .get(&url)
            .query(&[("condition_ids", condition_id)])
            .send()
            .await
            .context("Failed to fetch market")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Market request failed: {} - {}", status, body);
        }

        let markets: Vec<GammaMarket> = response
            .json()
            .await
            .context("Failed to parse market response")?;

        let market = markets
            .first()
            .ok_or_else(|| anyhow::anyhow!("No market found for condition {}", condition_id))?;

        market
            .token_ids()
            .context("Failed to parse clobTokenIds")
    }
}

#[async_trait]
impl ActivityFeed for DataClient {
    async fn recent_activity(
        &self,
        address: &str,
        limit: u32,
    ) -> std::result::Result<Vec<ActivityEvent>, FeedError> {
        let items = self.get_activity(address, limit).await?;
        Ok(items.into_iter().map(ActivityResponse::into_event).collect())
    }
}

#[async_trait]
impl PositionsFeed for DataClient {
    async fn positions(&self, address: &str) -> Result<Vec<PositionRecord>> {
        let items = self.get_all_positions(address).await?;
        Ok(items.into_iter().map(PositionRecord::from).collect())
    }
}

#[async_trait]
impl TokenResolver for DataClient {
    async fn outcome_ids(&self, market_id: &str) -> Result<Vec<String>> {
        self.get_market_token_ids(market_id).await
    }
}
