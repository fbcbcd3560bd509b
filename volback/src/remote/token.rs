//! OAuth access token cache.
//!
//! The token is a plain value: a refresh produces a new `AccessToken` and the
//! client swaps it in under its lock.

use crate::utils::{Result, VolbackError};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

/// Tokens this close to expiry are treated as expired.
const EXPIRY_MARGIN_SECS: i64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// A bearer token and the instant it stops being valid.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn from_response(response: TokenResponse, now: DateTime<Utc>) -> Result<Self> {
        if response.access_token.is_empty() {
            return Err(VolbackError::Auth(
                "token endpoint returned an empty access token".to_string(),
            ));
        }
        Ok(Self {
            value: response.access_token,
            expires_at: now + Duration::seconds(response.expires_in),
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_MARGIN_SECS) >= self.expires_at
    }
}

/// True if `cached` is missing or expired at `now`.
pub fn needs_refresh(cached: Option<&AccessToken>, now: DateTime<Utc>) -> bool {
    cached.map_or(true, |token| token.is_expired(now))
}
