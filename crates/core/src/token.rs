//! Signed tracking tokens embedded in impression/click/event URLs.
//!
//! Format: `<base64url(payload JSON)>.<base64url(HMAC-SHA256(secret, payload))>`.
//! Payload keys are deliberately short; the token travels as a query
//! parameter on every tracking hit.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Custom-params limits; oversize entries are dropped at generation time so
/// every generated token verifies.
pub const MAX_CUSTOM_PARAMS: usize = 10;
pub const MAX_CUSTOM_KEY_LEN: usize = 50;
pub const MAX_CUSTOM_VALUE_LEN: usize = 100;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    /// Malformed structure or signature mismatch.
    #[error("invalid token")]
    Invalid,
    /// Structurally valid but older than the configured TTL.
    #[error("token expired")]
    Expired,
}

/// Tracking token payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingToken {
    /// Request id.
    pub r: String,
    /// Impression id.
    pub i: String,
    /// Creative id.
    pub c: i64,
    /// Campaign id.
    pub cid: i64,
    /// Line item id.
    pub l: i64,
    /// User id.
    pub u: String,
    /// Publisher id.
    pub p: i64,
    /// Placement id.
    pub pl: String,
    /// Bid price (CPM).
    pub bp: f64,
    /// Currency.
    pub cur: String,
    /// Issue time, unix seconds.
    pub t: i64,
    /// Optional custom params.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cp: Option<BTreeMap<String, String>>,
}

impl TrackingToken {
    /// Drop custom params that exceed the per-token limits. Ordered map, so
    /// which entries survive the count cap is deterministic.
    fn sanitized(&self) -> Self {
        let mut token = self.clone();
        if let Some(params) = token.cp.take() {
            let kept: BTreeMap<String, String> = params
                .into_iter()
                .filter(|(k, v)| k.len() <= MAX_CUSTOM_KEY_LEN && v.len() <= MAX_CUSTOM_VALUE_LEN)
                .take(MAX_CUSTOM_PARAMS)
                .collect();
            token.cp = (!kept.is_empty()).then_some(kept);
        }
        token
    }
}

/// Sign a tracking token, returning the two-part URL-safe string.
pub fn generate(token: &TrackingToken, secret: &[u8]) -> String {
    let payload = serde_json::to_vec(&token.sanitized())
        .expect("tracking token payload serializes");
    let payload_b64 = URL_SAFE_NO_PAD.encode(&payload);

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(&payload);
    let sig_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    format!("{payload_b64}.{sig_b64}")
}

/// Parse and verify a token string against `secret` and `ttl`.
pub fn verify(token: &str, secret: &[u8], ttl: Duration) -> Result<TrackingToken, TokenError> {
    let (payload_b64, sig_b64) = token.trim().split_once('.').ok_or(TokenError::Invalid)?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| TokenError::Invalid)?;
    let signature = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| TokenError::Invalid)?;

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(&payload);
    mac.verify_slice(&signature).map_err(|_| TokenError::Invalid)?;

    let parsed: TrackingToken =
        serde_json::from_slice(&payload).map_err(|_| TokenError::Invalid)?;

    let age = Utc::now().timestamp() - parsed.t;
    if age > ttl.as_secs() as i64 {
        return Err(TokenError::Expired);
    }

    Ok(parsed)
}
