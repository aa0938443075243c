//! API response types for the Polymarket Data and Gamma APIs.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{ActivityEvent, ActivityKind, TradeSide};

/// Activity response from /activity endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityResponse {
    #[serde(rename = "type")]
    pub activity_type: String,
    #[serde(default)]
    pub condition_id: String,
    #[serde(default)]
    pub asset: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub size: Decimal,
    #[serde(default)]
    pub usdc_size: Decimal,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub event_slug: String,
}

impl ActivityResponse {
    pub fn into_event(self) -> ActivityEvent {
        let kind = ActivityKind::from_feed(&self.activity_type);
        let side = match kind {
            ActivityKind::Trade => TradeSide::from_feed(&self.side),
            _ => None,
        };
        let label = if self.title.is_empty() {
            self.event_slug
        } else {
            self.title
        };

        ActivityEvent {
            kind,
            side,
            market_id: self.condition_id,
            outcome_id: self.asset,
            share_size: self.size.max(Decimal::ZERO),
            cash_size: self.usdc_size.max(Decimal::ZERO),
            price: self.price.max(Decimal::ZERO),
            observed_at: self.timestamp,
            label,
        }
    }
}

/// Position response from /positions endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionResponse {
    pub condition_id: String,
    pub asset: String,
    pub size: Decimal,
}

/// One held outcome in a positions snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionRecord {
    pub market_id: String,
    pub outcome_id: String,
    pub size: Decimal,
}

impl From<PositionResponse> for PositionRecord {
    fn from(p: PositionResponse) -> Self {
        Self {
            market_id: p.condition_id,
            outcome_id: p.asset,
            size: p.size,
        }
    }
}

/// Market from the Gamma /markets endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GammaMarket {
    /// JSON-encoded array of token IDs
    #[serde(default)]
    pub clob_token_ids: String,
}

impl GammaMarket {
    pub fn token_ids(&self) -> serde_json::Result<Vec<String>> {
        if self.clob_token_ids.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&self.clob_token_ids)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityParams<'a> {
    pub user: &'a str,
    pub limit: u32,
    pub sort_by: &'a str,
    pub sort_direction: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionsParams<'a> {
    pub user: &'a str,
    pub size_threshold: Decimal,
    pub limit: u32,
    pub offset: u32,
}

/// Result of handing an order or transaction to a downstream service.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionReceipt {
    pub success: bool,
    /// Order ID or transaction hash
    pub reference: Option<String>,
    pub message: String,
}

impl SubmissionReceipt {
    pub fn accepted(reference: Option<String>) -> Self {
        Self {
            success: true,
            reference,
            message: String::new(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            reference: None,
            message: message.into(),
        }
    }
}
