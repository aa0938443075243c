//! Relayer client for gasless conditional-token operations.
//!
//! Split, merge and redeem are calls on the Conditional Tokens (CTF) contract,
//! wrapped in a Safe transaction signed by the owner key and submitted through
//! the Polymarket builder relayer, which pays the gas.

use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::{keccak256, Address, U256};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::models::{ChainOperation, ChainOperationKind};

use super::auth::{hmac_signature, unix_timestamp};
use super::polygon_client::USDC_E;
use super::types::SubmissionReceipt;
use super::ChainExecutor;

pub const RELAYER_URL: &str = "https://relayer-v2.polymarket.com";

/// Conditional Tokens Framework contract on Polygon
pub const CTF: &str = "0x4D97DCd97eC945f40cF65F87097ACe5EA0476045";

const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";
/// Binary markets: index sets for outcome 0 and outcome 1
const PARTITION: [u64; 2] = [1, 2];

/// Builder API credentials.
#[derive(Debug, Clone)]
pub struct RelayerCredentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignatureParams {
    gas_price: String,
    operation: String,
    safe_txn_gas: String,
    base_gas: String,
    gas_token: String,
    refund_receiver: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest {
    from: String,
    to: String,
    proxy_wallet: String,
    data: String,
    nonce: String,
    signature: String,
    signature_params: SignatureParams,
    #[serde(rename = "type")]
    tx_type: String,
    metadata: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    #[serde(rename = "transactionID")]
    transaction_id: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionStatus {
    #[serde(default)]
    state: String,
    #[serde(default)]
    transaction_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct NonceResponse {
    nonce: String,
}

/// Where a relayed transaction stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayState {
    Pending,
    Confirmed,
    Failed,
}

impl RelayState {
    fn parse(state: &str) -> Self {
        match state {
            "STATE_MINED" | "STATE_CONFIRMED" => Self::Confirmed,
            "STATE_FAILED" | "STATE_INVALID" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Relayer client executing CTF operations from the copier's Safe.
pub struct RelayerClient {
    http: Client,
    url: String,
    signer: PrivateKeySigner,
    safe: Address,
    credentials: RelayerCredentials,
    chain_id: u64,
    poll_interval: Duration,
    confirm_timeout: Duration,
}

impl RelayerClient {
    pub fn new(
        url: &str,
        private_key: &str,
        safe: &str,
        credentials: RelayerCredentials,
        chain_id: u64,
    ) -> Result<Self> {
        let pk = private_key.strip_prefix("0x").unwrap_or(private_key);
        let signer = PrivateKeySigner::from_str(pk).context("Invalid private key")?;
        let safe = Address::from_str(safe).context("Invalid proxy wallet address")?;

        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            url: url.trim_end_matches('/').to_string(),
            signer,
            safe,
            credentials,
            chain_id,
            poll_interval: Duration::from_secs(2),
            confirm_timeout: Duration::from_secs(120),
        })
    }

    /// Submit one CTF call and wait until it is mined or fails.
    async fn relay(&self, call_data: Vec<u8>, metadata: &str) -> Result<SubmissionReceipt> {
        let ctf = Address::from_str(CTF)?;
        let nonce = self.get_nonce().await?;
        let digest = self.safe_tx_hash(ctf, &call_data, nonce);

        let signature = self
            .signer
            .sign_message(digest.as_slice())
            .await
            .context("Failed to sign Safe transaction")?;

        let request = SubmitRequest {
            from: format!("{:?}", self.signer.address()),
            to: format!("{:?}", ctf),
            proxy_wallet: format!("{:?}", self.safe),
            data: format!("0x{}", hex::encode(&call_data)),
            nonce: nonce.to_string(),
            signature: format!("0x{}", hex::encode(Self::safe_signature_bytes(signature.as_bytes()))),
            signature_params: SignatureParams {
                gas_price: "0".to_string(),
                operation: "0".to_string(),
                safe_txn_gas: "0".to_string(),
                base_gas: "0".to_string(),
                gas_token: ZERO_ADDRESS.to_string(),
                refund_receiver: ZERO_ADDRESS.to_string(),
            },
            tx_type: "SAFE".to_string(),
            metadata: metadata.to_string(),
        };
        let body = serde_json::to_string(&request).context("Failed to serialize relay request")?;

        let resp = self
            .http
            .post(format!("{}/submit", self.url))
            .headers(self.builder_headers("POST", "/submit", &body)?)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .context("Failed to submit relay transaction")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Ok(SubmissionReceipt::rejected(format!(
                "Relayer rejected transaction: {} - {}",
                status, text
            )));
        }

        let submitted: SubmitResponse = resp
            .json()
            .await
            .context("Failed to parse relay response")?;
        debug!(id = %submitted.transaction_id, state = %submitted.state, "Relay transaction submitted");

        self.wait_for_confirmation(&submitted.transaction_id).await
    }

    async fn wait_for_confirmation(&self, transaction_id: &str) -> Result<SubmissionReceipt> {
        let deadline = Instant::now() + self.confirm_timeout;

        loop {
            let status = self.get_transaction(transaction_id).await?;
            match RelayState::parse(&status.state) {
                RelayState::Confirmed => {
                    return Ok(SubmissionReceipt::accepted(status.transaction_hash));
                }
                RelayState::Failed => {
                    return Ok(SubmissionReceipt::rejected(format!(
                        "Relay transaction {} ended in {}",
                        transaction_id, status.state
                    )));
                }
                RelayState::Pending => {}
            }

            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "Relay transaction {} not confirmed after {:?}",
                    transaction_id,
                    self.confirm_timeout
                ));
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn get_transaction(&self, transaction_id: &str) -> Result<TransactionStatus> {
        let resp = self
            .http
            .get(format!("{}/transaction", self.url))
            .query(&[("id", transaction_id)])
            .send()
            .await
            .context("Failed to fetch relay transaction")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Relay status request failed: {} - {}", status, text));
        }

        let mut items: Vec<TransactionStatus> = resp
            .json()
            .await
            .context("Failed to parse relay transaction")?;
        items
            .pop()
            .ok_or_else(|| anyhow!("Unknown relay transaction {}", transaction_id))
    }

    async fn get_nonce(&self) -> Result<u64> {
        let address = format!("{:?}", self.signer.address());
        let resp = self
            .http
            .get(format!("{}/nonce", self.url))
            .query(&[("address", address.as_str()), ("type", "SAFE")])
            .send()
            .await
            .context("Failed to fetch relay nonce")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Nonce request failed: {} - {}", status, text));
        }

        let nonce: NonceResponse = resp.json().await.context("Failed to parse nonce")?;
        nonce.nonce.parse().context("Invalid nonce")
    }

    fn builder_headers(&self, method: &str, path: &str, body: &str) -> Result<HeaderMap> {
        let timestamp = unix_timestamp()?;
        let signature = hmac_signature(&self.credentials.secret, &timestamp, method, path, body)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("poly_builder_api_key"),
            HeaderValue::from_str(&self.credentials.api_key)?,
        );
        headers.insert(
            HeaderName::from_static("poly_builder_passphrase"),
            HeaderValue::from_str(&self.credentials.passphrase)?,
        );
        headers.insert(
            HeaderName::from_static("poly_builder_timestamp"),
            HeaderValue::from_str(&timestamp)?,
        );
        headers.insert(
            HeaderName::from_static("poly_builder_signature"),
            HeaderValue::from_str(&signature)?,
        );
        Ok(headers)
    }

    /// EIP-712 hash of a zero-gas Safe call to `to`.
    fn safe_tx_hash(&self, to: Address, data: &[u8], nonce: u64) -> [u8; 32] {
        let domain_type = keccak256(b"EIP712Domain(uint256 chainId,address verifyingContract)");
        let mut domain = Vec::with_capacity(3 * 32);
        domain.extend_from_slice(domain_type.as_slice());
        domain.extend_from_slice(&U256::from(self.chain_id).to_be_bytes::<32>());
        domain.extend_from_slice(&encode_address(self.safe));
        let domain_separator = keccak256(&domain);

        let tx_type = keccak256(
            b"SafeTx(address to,uint256 value,bytes data,uint8 operation,uint256 safeTxGas,uint256 baseGas,uint256 gasPrice,address gasToken,address refundReceiver,uint256 nonce)",
        );
        let zero = [0u8; 32];
        let mut tx = Vec::with_capacity(11 * 32);
        tx.extend_from_slice(tx_type.as_slice());
        tx.extend_from_slice(&encode_address(to));
        tx.extend_from_slice(&zero); // value
        tx.extend_from_slice(keccak256(data).as_slice());
        tx.extend_from_slice(&zero); // operation: call
        tx.extend_from_slice(&zero); // safeTxGas
        tx.extend_from_slice(&zero); // baseGas
        tx.extend_from_slice(&zero); // gasPrice
        tx.extend_from_slice(&zero); // gasToken
        tx.extend_from_slice(&zero); // refundReceiver
        tx.extend_from_slice(&U256::from(nonce).to_be_bytes::<32>());
        let struct_hash = keccak256(&tx);

        let mut message = vec![0x19, 0x01];
        message.extend_from_slice(domain_separator.as_slice());
        message.extend_from_slice(struct_hash.as_slice());
        keccak256(&message).0
    }

    /// Safe marks eth_sign signatures by adding 4 to `v`.
    fn safe_signature_bytes(raw: [u8; 65]) -> [u8; 65] {
        let mut sig = raw;
        let v = sig[64];
        sig[64] = if v < 27 { v + 31 } else { v + 4 };
        sig
    }
}

#[async_trait]
impl ChainExecutor for RelayerClient {
    async fn execute(&self, operation: &ChainOperation) -> Result<SubmissionReceipt> {
        let call_data = encode_ctf_call(operation)?;
        let metadata = format!("{} positions", operation.kind.as_str());

        let receipt = self.relay(call_data, &metadata).await?;
        if receipt.success {
            info!(
                action = %operation.kind.as_str(),
                tx = ?receipt.reference,
                "Transaction completed"
            );
        }
        Ok(receipt)
    }
}

/// ABI-encode the CTF call for an operation.
fn encode_ctf_call(operation: &ChainOperation) -> Result<Vec<u8>> {
    let collateral = Address::from_str(USDC_E)?;
    let condition = parse_bytes32(&operation.market_id)?;

    let (signature, amount) = match operation.kind {
        ChainOperationKind::Split => (
            "splitPosition(address,bytes32,bytes32,uint256[],uint256)",
            Some(require_amount(operation)?),
        ),
        ChainOperationKind::Merge => (
            "mergePositions(address,bytes32,bytes32,uint256[],uint256)",
            Some(require_amount(operation)?),
        ),
        ChainOperationKind::Redeem => ("redeemPositions(address,bytes32,bytes32,uint256[])", None),
    };

    let head_words: u64 = if amount.is_some() { 5 } else { 4 };

    let mut data = Vec::with_capacity(4 + 32 * (head_words as usize + 1 + PARTITION.len()));
    data.extend_from_slice(&keccak256(signature.as_bytes())[..4]);
    data.extend_from_slice(&encode_address(collateral));
    data.extend_from_slice(&[0u8; 32]); // parentCollectionId
    data.extend_from_slice(&condition);
    data.extend_from_slice(&U256::from(head_words * 32).to_be_bytes::<32>());
    if let Some(amount) = amount {
        data.extend_from_slice(&amount.to_be_bytes::<32>());
    }
    data.extend_from_slice(&U256::from(PARTITION.len() as u64).to_be_bytes::<32>());
    for index_set in PARTITION {
        data.extend_from_slice(&U256::from(index_set).to_be_bytes::<32>());
    }
    Ok(data)
}

fn require_amount(operation: &ChainOperation) -> Result<U256> {
    let amount = operation
        .amount
        .ok_or_else(|| anyhow!("{} requires an amount", operation.kind.as_str()))?;
    usdc_base_units(amount)
}

/// USDC amounts on chain carry 6 decimals.
fn usdc_base_units(amount: Decimal) -> Result<U256> {
    let units = (amount * Decimal::from(1_000_000u64)).trunc();
    let units: u128 = units
        .to_string()
        .parse()
        .with_context(|| format!("Invalid on-chain amount {}", amount))?;
    Ok(U256::from(units))
}

fn parse_bytes32(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str.trim_start_matches("0x")).context("Invalid condition ID")?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| anyhow!("Condition ID must be 32 bytes: {}", hex_str))
}

fn encode_address(addr: Address) -> [u8; 32] {
    let mut buf = [0u8; 32];
    buf[12..].copy_from_slice(addr.as_slice());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const CONDITION: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    #[test]
    fn test_encode_split() {
        let data = encode_ctf_call(&ChainOperation::split(CONDITION, dec!(2.5))).unwrap();

        assert_eq!(
            &data[..4],
            &keccak256(b"splitPosition(address,bytes32,bytes32,uint256[],uint256)")[..4]
        );
        // selector + 5 head words + length + 2 elements
        assert_eq!(data.len(), 4 + 32 * 8);
        // array offset points past the head
        assert_eq!(data[4 + 32 * 3 + 31], 0xa0);
        // amount in base units: 2_500_000 = 0x2625a0
        assert_eq!(&data[4 + 32 * 4 + 29..4 + 32 * 5], &[0x26, 0x25, 0xa0]);
        assert_eq!(data[4 + 32 * 5 + 31], 2);
        assert_eq!(data[4 + 32 * 6 + 31], 1);
        assert_eq!(data[4 + 32 * 7 + 31], 2);
    }

    #[test]
    fn test_encode_redeem_has_no_amount() {
        let data = encode_ctf_call(&ChainOperation::redeem(CONDITION)).unwrap();
        assert_eq!(data.len(), 4 + 32 * 7);
        assert_eq!(data[4 + 32 * 3 + 31], 0x80);
    }

    #[test]
    fn test_merge_without_amount_fails() {
        let op = ChainOperation {
            kind: ChainOperationKind::Merge,
            market_id: CONDITION.to_string(),
            amount: None,
        };
        assert!(encode_ctf_call(&op).is_err());
    }

    #[test]
    fn test_bad_condition_id() {
        assert!(encode_ctf_call(&ChainOperation::redeem("0x1234")).is_err());
    }

    #[test]
    fn test_safe_signature_v() {
        let mut raw = [0u8; 65];
        raw[64] = 27;
        assert_eq!(RelayerClient::safe_signature_bytes(raw)[64], 31);
        raw[64] = 1;
        assert_eq!(RelayerClient::safe_signature_bytes(raw)[64], 32);
    }

    #[test]
    fn test_relay_states() {
        assert_eq!(RelayState::parse("STATE_MINED"), RelayState::Confirmed);
        assert_eq!(RelayState::parse("STATE_FAILED"), RelayState::Failed);
        assert_eq!(RelayState::parse("STATE_NEW"), RelayState::Pending);
    }
}
