//! Polygon RPC client for on-chain USDC balances.

use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::Address;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::BalanceSource;

/// Bridged USDC (USDC.e) on Polygon, the exchange collateral
pub const USDC_E: &str = "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174";
const USDC_DECIMALS: u32 = 6;
/// keccak256("balanceOf(address)")[..4]
const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

/// Polygon JSON-RPC client.
pub struct PolygonClient {
    rpc_url: String,
    http: Client,
}

impl PolygonClient {
    pub fn new(rpc_url: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { rpc_url, http })
    }

    /// Read the USDC.e balance of an address.
    pub async fn usdc_balance(&self, address: &str) -> Result<Decimal> {
        let owner = Address::from_str(address).context("Invalid wallet address")?;
        let call_data = format!("0x{}", hex::encode(encode_balance_of(owner)));

        let params = serde_json::json!([
            { "to": USDC_E, "data": call_data },
            "latest"
        ]);

        let response: JsonRpcResponse<String> = self.rpc_call("eth_call", params).await?;

        if let Some(err) = response.error {
            return Err(anyhow!("eth_call failed: {} ({})", err.message, err.code));
        }
        let raw = response.result.ok_or_else(|| anyhow!("No result in eth_call response"))?;

        debug!(address = %address, raw = %raw, "Fetched USDC balance");
        parse_token_amount(&raw, USDC_DECIMALS)
    }

    async fn rpc_call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<JsonRpcResponse<T>> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .context("RPC request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("RPC request failed: {}", response.status());
        }

        response.json().await.context("Failed to parse RPC response")
    }
}

#[async_trait]
impl BalanceSource for PolygonClient {
    async fn cash_balance(&self, address: &str) -> Result<Decimal> {
        self.usdc_balance(address).await
    }
}

fn encode_balance_of(owner: Address) -> Vec<u8> {
    let mut data = Vec::with_capacity(36);
    data.extend_from_slice(&BALANCE_OF_SELECTOR);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(owner.as_slice());
    data
}

/// Convert a hex-encoded uint256 into a token amount with the given decimals.
fn parse_token_amount(raw: &str, decimals: u32) -> Result<Decimal> {
    let digits = raw.trim_start_matches("0x").trim_start_matches('0');
    if digits.is_empty() {
        return Ok(Decimal::ZERO);
    }
    let value = u128::from_str_radix(digits, 16).context("Balance does not fit in 128 bits")?;
    let value = i128::try_from(value).context("Balance out of range")?;
    Decimal::try_from_i128_with_scale(value, decimals).context("Balance out of decimal range")
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'a str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}
