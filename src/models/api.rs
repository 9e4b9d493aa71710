use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::{AuthClaims, IssuedToken};

/// Credentials exchanged for a token at `POST /auth`.
#[derive(Deserialize)]
pub struct TokenRequest {
    /// Application key
    #[serde(default)]
    pub app_key: String,
    /// Application secret
    #[serde(default)]
    pub app_secret: String,
}

impl std::fmt::Debug for TokenRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRequest")
            .field("app_key", &self.app_key)
            .field("app_secret", &"[REDACTED]")
            .finish()
    }
}

/// Response after a token has been issued.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Compact JWT
    pub token: String,
    /// Always `Bearer`
    pub token_type: String,
    /// Expiry timestamp
    pub expires_at: DateTime<Utc>,
    /// Seconds until expiry at issue time
    pub expires_in: u64,
}

impl TokenResponse {
    pub fn from_issued(issued: IssuedToken) -> Self {
        let expires_in = issued
            .claims
            .expires_at
            .saturating_sub(issued.claims.issued_at)
            .max(0)
            .unsigned_abs();
        Self {
            expires_at: issued.claims.expires_at_utc().unwrap_or_else(Utc::now),
            token: issued.token,
            token_type: "Bearer".to_string(),
            expires_in,
        }
    }
}

/// Identity behind the presented token.
#[derive(Debug, Serialize, Deserialize)]
pub struct WhoAmIResponse {
    /// Hex SHA-256 of the application key
    pub subject: String,
    /// Token issuer
    pub issuer: String,
    /// Unique token id
    pub token_id: String,
    /// Issue timestamp (Unix seconds)
    pub issued_at: i64,
    /// Expiry timestamp (Unix seconds)
    pub expires_at: i64,
}

impl From<AuthClaims> for WhoAmIResponse {
    fn from(claims: AuthClaims) -> Self {
        Self {
            subject: claims.subject,
            issuer: claims.issuer,
            token_id: claims.jti,
            issued_at: claims.issued_at,
            expires_at: claims.expires_at,
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service health status
    pub status: String,
    /// Service version
    pub version: String,
    /// Uptime in seconds
    pub uptime_seconds: u64,
    /// Live rate limit buckets
    pub rate_limit_buckets: usize,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}
