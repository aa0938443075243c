//! HMAC request signatures shared by the CLOB and relayer clients.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Current unix time in seconds, as sent in auth headers.
pub fn unix_timestamp() -> Result<String> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("System clock is before UNIX epoch")?
        .as_secs()
        .to_string())
}

/// Base64url(HMAC-SHA256(secret, timestamp + method + path + body)).
pub fn hmac_signature(
    secret: &str,
    timestamp: &str,
    method: &str,
    path: &str,
    body: &str,
) -> Result<String> {
    let key = URL_SAFE
        .decode(secret)
        .context("API secret is not valid base64")?;
    let mut mac =
        HmacSha256::new_from_slice(&key).map_err(|e| anyhow!("HMAC init failed: {}", e))?;
    mac.update(format!("{}{}{}{}", timestamp, method, path, body).as_bytes());
    Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
}
