//! Polymarket CLOB (Central Limit Order Book) client for order execution.
//!
//! The CLOB is Polymarket's off-chain order matching engine that settles on Polygon.
//! This client handles:
//! - Order signing using EIP-712 typed data
//! - L1 (EIP-712 ClobAuth) creation or derivation of API credentials
//! - L2 (HMAC) authenticated order submission
//! - Resolving a limit price for cash-sized market orders from the book

use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::{keccak256, Address, B256, U256};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::models::{OrderIntent, OrderLifetime, OrderSizing, TradeSide};

use super::auth::{hmac_signature, unix_timestamp};
use super::types::SubmissionReceipt;
use super::OrderSubmitter;

pub const CLOB_URL: &str = "https://clob.polymarket.com";

/// Polymarket CTF Exchange contract on Polygon
pub const CTF_EXCHANGE: &str = "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E";

/// Fixed statement signed for L1 authentication
const CLOB_AUTH_MESSAGE: &str = "This message attests that I control the given wallet";

const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";
const MAX_PRICE: Decimal = dec!(0.99);
const MIN_PRICE: Decimal = dec!(0.01);

/// Order type in the CLOB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    /// Good-til-cancelled limit order
    Gtc,
    /// Fill-or-kill market order
    Fok,
}

impl From<OrderLifetime> for OrderType {
    fn from(lifetime: OrderLifetime) -> Self {
        match lifetime {
            OrderLifetime::FillOrKill => OrderType::Fok,
            OrderLifetime::GoodTillCancelled => OrderType::Gtc,
        }
    }
}

/// L2 API credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct ClobCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
}

/// Body returned by the `/auth/api-key` endpoints
#[derive(Debug, Clone, Deserialize)]
struct ApiKeyResponse {
    #[serde(rename = "apiKey")]
    api_key: String,
    secret: String,
    passphrase: String,
}

impl From<ApiKeyResponse> for ClobCredentials {
    fn from(r: ApiKeyResponse) -> Self {
        Self {
            api_key: r.api_key,
            api_secret: r.secret,
            api_passphrase: r.passphrase,
        }
    }
}

/// Signed order ready for submission
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedOrder {
    pub salt: String,
    pub maker: String,
    pub signer: String,
    pub taker: String,
    pub token_id: String,
    pub maker_amount: String,
    pub taker_amount: String,
    pub side: String,
    pub expiration: String,
    pub nonce: String,
    pub fee_rate_bps: String,
    pub signature_type: u8,
    pub signature: String,
}

/// Order submission request body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPayload {
    pub order: SignedOrder,
    pub owner: String,
    pub order_type: OrderType,
}

/// Response from order placement
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    #[serde(rename = "orderID", alias = "orderId")]
    pub order_id: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error_msg: String,
}

/// Order book entry
#[derive(Debug, Clone, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
}

/// Order book response
#[derive(Debug, Clone, Deserialize)]
pub struct OrderBook {
    #[serde(default)]
    pub bids: Vec<BookLevel>,
    #[serde(default)]
    pub asks: Vec<BookLevel>,
}

/// Amounts and prices of one order, in base units.
#[derive(Debug, Clone, PartialEq)]
struct OrderAmounts {
    maker_amount: String,
    taker_amount: String,
}

/// CLOB API client for executing trades on Polymarket.
pub struct ClobClient {
    http: Client,
    host: String,
    signer: PrivateKeySigner,
    /// Wallet holding the funds; the proxy address for proxy wallets
    funder: Address,
    signature_type: u8,
    credentials: Option<ClobCredentials>,
    chain_id: u64,
    slippage: Decimal,
}

impl ClobClient {
    /// Create a new CLOB client.
    ///
    /// # Arguments
    /// * `host` - CLOB base URL
    /// * `private_key` - Ethereum private key (hex string, with or without 0x prefix)
    /// * `funder` - Address holding the funds (proxy wallet), defaults to the signer
    /// * `signature_type` - 0 = EOA, 1 = Poly proxy, 2 = Gnosis Safe proxy
    /// * `credentials` - L2 credentials, if already known
    /// * `chain_id` - Polygon chain ID (137 for mainnet)
    pub fn new(
        host: &str,
        private_key: &str,
        funder: Option<&str>,
        signature_type: u8,
        credentials: Option<ClobCredentials>,
        chain_id: u64,
    ) -> Result<Self> {
        let pk = private_key.strip_prefix("0x").unwrap_or(private_key);
        let signer = PrivateKeySigner::from_str(pk).context("Invalid private key")?;

        let funder = match funder {
            Some(addr) => Address::from_str(addr).context("Invalid funder address")?,
            None => signer.address(),
        };

        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            host: host.trim_end_matches('/').to_string(),
            signer,
            funder,
            signature_type,
            credentials,
            chain_id,
            slippage: dec!(0.005),
        })
    }

    /// Get the signing address.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Whether L2 credentials are loaded.
    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    fn credentials(&self) -> Result<&ClobCredentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| anyhow!("CLOB API credentials not set"))
    }

    /// Create API credentials, falling back to deriving the existing ones.
    ///
    /// Both calls are L1-authenticated with a ClobAuth signature from the
    /// private key. The result is kept for subsequent order submissions.
    pub async fn create_or_derive_credentials(&mut self) -> Result<ClobCredentials> {
        let credentials = match self.request_api_key(reqwest::Method::POST, "/auth/api-key").await {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(error = %e, "Creating API key failed, deriving instead");
                self.request_api_key(reqwest::Method::GET, "/auth/derive-api-key")
                    .await?
            }
        };
        info!(api_key = %credentials.api_key, "CLOB API credentials ready");
        self.credentials = Some(credentials.clone());
        Ok(credentials)
    }

    async fn request_api_key(&self, method: reqwest::Method, path: &str) -> Result<ClobCredentials> {
        let headers = self.build_l1_headers(&unix_timestamp()?, 0).await?;
        let url = format!("{}{}", self.host, path);
        let resp = self
            .http
            .request(method, &url)
            .headers(headers)
            .send()
            .await
            .with_context(|| format!("Failed to call {}", path))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("{} failed: {} - {}", path, status, text));
        }

        let body: ApiKeyResponse = resp.json().await.context("Failed to parse API key response")?;
        Ok(body.into())
    }

    /// Build L1 authentication headers around a ClobAuth signature.
    async fn build_l1_headers(&self, timestamp: &str, nonce: u64) -> Result<HeaderMap> {
        let digest = clob_auth_digest(self.address(), timestamp, nonce, self.chain_id);
        let signature = self
            .signer
            .sign_hash(&digest)
            .await
            .context("Failed to sign CLOB auth message")?;

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("poly_address"),
            HeaderValue::from_str(&format!("{:?}", self.address()))?,
        );
        headers.insert(
            HeaderName::from_static("poly_signature"),
            HeaderValue::from_str(&format!("0x{}", hex::encode(signature.as_bytes())))?,
        );
        headers.insert(
            HeaderName::from_static("poly_timestamp"),
            HeaderValue::from_str(timestamp)?,
        );
        headers.insert(
            HeaderName::from_static("poly_nonce"),
            HeaderValue::from_str(&nonce.to_string())?,
        );
        Ok(headers)
    }

    /// Get order book for a token.
    pub async fn get_order_book(&self, token_id: &str) -> Result<OrderBook> {
        let url = format!("{}/book", self.host);
        let resp = self
            .http
            .get(&url)
            .query(&[("token_id", token_id)])
            .send()
            .await
            .context("Failed to fetch order book")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Failed to get order book: {} - {}", status, text));
        }

        resp.json().await.context("Failed to parse order book")
    }

    /// Best price on the opposite side of the book, padded by the slippage tolerance.
    async fn marketable_price(&self, token_id: &str, side: TradeSide) -> Result<Decimal> {
        let book = self.get_order_book(token_id).await?;
        let price = match side {
            TradeSide::Buy => book
                .asks
                .iter()
                .map(|l| l.price)
                .min()
                .ok_or_else(|| anyhow!("No asks available"))?
                * (Decimal::ONE + self.slippage),
            TradeSide::Sell => book
                .bids
                .iter()
                .map(|l| l.price)
                .max()
                .ok_or_else(|| anyhow!("No bids available"))?
                * (Decimal::ONE - self.slippage),
        };
        Ok(price.round_dp(2).clamp(MIN_PRICE, MAX_PRICE))
    }

    /// Turn an intent into (shares, price).
    async fn resolve_shares_and_price(&self, order: &OrderIntent) -> Result<(Decimal, Decimal)> {
        match order.sizing {
            OrderSizing::Limit { shares, price } => Ok((shares, price)),
            OrderSizing::Market { amount } => {
                let price = self.marketable_price(&order.token_id, order.side).await?;
                let shares = match order.side {
                    TradeSide::Buy => amount / price,
                    TradeSide::Sell => amount,
                };
                Ok((shares, price))
            }
        }
    }

    /// Place an order with full control over parameters.
    pub async fn place_order(
        &self,
        token_id: &str,
        side: TradeSide,
        shares: Decimal,
        price: Decimal,
        order_type: OrderType,
    ) -> Result<OrderResponse> {
        let signed_order = self.build_signed_order(token_id, side, shares, price).await?;

        let payload = OrderPayload {
            order: signed_order,
            owner: self.credentials()?.api_key.clone(),
            order_type,
        };
        let body = serde_json::to_string(&payload).context("Failed to serialize order")?;

        let url = format!("{}/order", self.host);
        let resp = self
            .http
            .post(&url)
            .headers(self.build_l2_headers("POST", "/order", &body)?)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .context("Failed to submit order")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Order placement failed: {} - {}", status, text));
        }

        resp.json().await.context("Failed to parse order response")
    }

    /// Build a signed order for submission.
    async fn build_signed_order(
        &self,
        token_id: &str,
        side: TradeSide,
        shares: Decimal,
        price: Decimal,
    ) -> Result<SignedOrder> {
        let maker = format!("{:?}", self.funder);
        let signer = format!("{:?}", self.address());
        let taker = ZERO_ADDRESS.to_string();

        let amounts = Self::order_amounts(side, shares, price);
        let side_index: u8 = match side {
            TradeSide::Buy => 0,
            TradeSide::Sell => 1,
        };

        let salt = Self::generate_salt();
        let nonce = "0".to_string();
        let expiration = "0".to_string();
        let fee_rate_bps = "0".to_string();

        let order_hash = self.compute_order_hash(
            &salt,
            &maker,
            &signer,
            &taker,
            token_id,
            &amounts,
            &expiration,
            &nonce,
            &fee_rate_bps,
            side_index,
        )?;
        let domain_hash = self.compute_domain_separator()?;

        // keccak256("\x19\x01" + domainSeparator + orderHash)
        let mut message = vec![0x19, 0x01];
        message.extend_from_slice(&domain_hash);
        message.extend_from_slice(&order_hash);
        let digest = keccak256(&message);

        let signature = self
            .signer
            .sign_hash(&digest)
            .await
            .context("Failed to sign order")?;

        Ok(SignedOrder {
            salt,
            maker,
            signer,
            taker,
            token_id: token_id.to_string(),
            maker_amount: amounts.maker_amount,
            taker_amount: amounts.taker_amount,
            side: side.as_str().to_string(),
            expiration,
            nonce,
            fee_rate_bps,
            signature_type: self.signature_type,
            signature: format!("0x{}", hex::encode(signature.as_bytes())),
        })
    }

    /// The maker gives USDC on a buy and shares on a sell.
    fn order_amounts(side: TradeSide, shares: Decimal, price: Decimal) -> OrderAmounts {
        let shares = shares.round_dp_with_strategy(2, RoundingStrategy::ToZero);
        let cash = (shares * price).round_dp_with_strategy(4, RoundingStrategy::ToZero);
        match side {
            TradeSide::Buy => OrderAmounts {
                maker_amount: Self::to_base_units(cash),
                taker_amount: Self::to_base_units(shares),
            },
            TradeSide::Sell => OrderAmounts {
                maker_amount: Self::to_base_units(shares),
                taker_amount: Self::to_base_units(cash),
            },
        }
    }

    /// Compute the EIP-712 order struct hash.
    #[allow(clippy::too_many_arguments)]
    fn compute_order_hash(
        &self,
        salt: &str,
        maker: &str,
        signer: &str,
        taker: &str,
        token_id: &str,
        amounts: &OrderAmounts,
        expiration: &str,
        nonce: &str,
        fee_rate_bps: &str,
        side: u8,
    ) -> Result<[u8; 32]> {
        let type_hash = keccak256(
            b"Order(uint256 salt,address maker,address signer,address taker,uint256 tokenId,uint256 makerAmount,uint256 takerAmount,uint256 expiration,uint256 nonce,uint256 feeRateBps,uint8 side,uint8 signatureType)"
        );

        let mut encoded = Vec::with_capacity(13 * 32);
        encoded.extend_from_slice(type_hash.as_slice());
        encoded.extend_from_slice(&Self::encode_uint256(salt)?);
        encoded.extend_from_slice(&Self::encode_address(maker)?);
        encoded.extend_from_slice(&Self::encode_address(signer)?);
        encoded.extend_from_slice(&Self::encode_address(taker)?);
        encoded.extend_from_slice(&Self::encode_uint256(token_id)?);
        encoded.extend_from_slice(&Self::encode_uint256(&amounts.maker_amount)?);
        encoded.extend_from_slice(&Self::encode_uint256(&amounts.taker_amount)?);
        encoded.extend_from_slice(&Self::encode_uint256(expiration)?);
        encoded.extend_from_slice(&Self::encode_uint256(nonce)?);
        encoded.extend_from_slice(&Self::encode_uint256(fee_rate_bps)?);
        encoded.extend_from_slice(&Self::encode_uint8(side));
        encoded.extend_from_slice(&Self::encode_uint8(self.signature_type));

        Ok(keccak256(&encoded).0)
    }

    /// Compute the EIP-712 domain separator.
    fn compute_domain_separator(&self) -> Result<[u8; 32]> {
        let type_hash = keccak256(
            b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)",
        );
        let name_hash = keccak256(b"Polymarket CTF Exchange");
        let version_hash = keccak256(b"1");

        let mut encoded = Vec::with_capacity(5 * 32);
        encoded.extend_from_slice(type_hash.as_slice());
        encoded.extend_from_slice(name_hash.as_slice());
        encoded.extend_from_slice(version_hash.as_slice());
        encoded.extend_from_slice(&U256::from(self.chain_id).to_be_bytes::<32>());
        encoded.extend_from_slice(&Self::encode_address(CTF_EXCHANGE)?);

        Ok(keccak256(&encoded).0)
    }

    /// Build L2 authentication headers (HMAC over timestamp, method, path and body).
    fn build_l2_headers(&self, method: &str, path: &str, body: &str) -> Result<HeaderMap> {
        let credentials = self.credentials()?;
        let timestamp = unix_timestamp()?;
        let signature = hmac_signature(&credentials.api_secret, &timestamp, method, path, body)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("poly_address"),
            HeaderValue::from_str(&format!("{:?}", self.address()))?,
        );
        headers.insert(
            HeaderName::from_static("poly_signature"),
            HeaderValue::from_str(&signature)?,
        );
        headers.insert(
            HeaderName::from_static("poly_timestamp"),
            HeaderValue::from_str(&timestamp)?,
        );
        headers.insert(
            HeaderName::from_static("poly_api_key"),
            HeaderValue::from_str(&credentials.api_key)?,
        );
        headers.insert(
            HeaderName::from_static("poly_passphrase"),
            HeaderValue::from_str(&credentials.api_passphrase)?,
        );

        Ok(headers)
    }

    /// Convert a USDC or share amount to 6-decimal base units.
    fn to_base_units(amount: Decimal) -> String {
        let units = (amount * Decimal::from(1_000_000u64)).trunc();
        units.to_string()
    }

    /// Encode address to 32-byte padded format.
    fn encode_address(addr: &str) -> Result<[u8; 32]> {
        let addr = Address::from_str(addr).context("Invalid address")?;
        let mut buf = [0u8; 32];
        buf[12..].copy_from_slice(addr.as_slice());
        Ok(buf)
    }

    /// Encode uint256 from a decimal string.
    fn encode_uint256(value: &str) -> Result<[u8; 32]> {
        let n = U256::from_str_radix(value, 10)
            .map_err(|e| anyhow!("Invalid uint256 {}: {}", value, e))?;
        Ok(n.to_be_bytes())
    }

    /// Encode uint8 to 32-byte padded format.
    fn encode_uint8(value: u8) -> [u8; 32] {
        let mut buf = [0u8; 32];
        buf[31] = value;
        buf
    }

    fn generate_salt() -> String {
        // Salt must fit comfortably in a JS number on the server side
        (uuid::Uuid::new_v4().as_u128() >> 76).to_string()
    }
}

/// EIP-712 digest of `ClobAuth(address address,string timestamp,uint256 nonce,string message)`
/// under the `ClobAuthDomain` domain, which has no verifying contract.
fn clob_auth_digest(address: Address, timestamp: &str, nonce: u64, chain_id: u64) -> B256 {
    let domain_type_hash =
        keccak256(b"EIP712Domain(string name,string version,uint256 chainId)");
    let mut domain = Vec::with_capacity(4 * 32);
    domain.extend_from_slice(domain_type_hash.as_slice());
    domain.extend_from_slice(keccak256(b"ClobAuthDomain").as_slice());
    domain.extend_from_slice(keccak256(b"1").as_slice());
    domain.extend_from_slice(&U256::from(chain_id).to_be_bytes::<32>());
    let domain_separator = keccak256(&domain);

    let type_hash =
        keccak256(b"ClobAuth(address address,string timestamp,uint256 nonce,string message)");
    let mut encoded = Vec::with_capacity(5 * 32);
    encoded.extend_from_slice(type_hash.as_slice());
    encoded.extend_from_slice(B256::left_padding_from(address.as_slice()).as_slice());
    encoded.extend_from_slice(keccak256(timestamp.as_bytes()).as_slice());
    encoded.extend_from_slice(&U256::from(nonce).to_be_bytes::<32>());
    encoded.extend_from_slice(keccak256(CLOB_AUTH_MESSAGE.as_bytes()).as_slice());
    let struct_hash = keccak256(&encoded);

    let mut message = vec![0x19, 0x01];
    message.extend_from_slice(domain_separator.as_slice());
    message.extend_from_slice(struct_hash.as_slice());
    keccak256(&message)
}

#[async_trait]
impl OrderSubmitter for ClobClient {
    async fn submit(&self, order: &OrderIntent) -> Result<SubmissionReceipt> {
        let (shares, price) = self.resolve_shares_and_price(order).await?;
        debug!(
            token = %order.token_id,
            side = %order.side.as_str(),
            shares = %shares,
            price = %price,
            "Submitting order"
        );

        let response = self
            .place_order(&order.token_id, order.side, shares, price, order.lifetime.into())
            .await?;

        if response.success {
            Ok(SubmissionReceipt::accepted(response.order_id))
        } else {
            Ok(SubmissionReceipt::rejected(response.error_msg))
        }
    }
}
