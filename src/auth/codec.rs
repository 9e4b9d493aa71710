//! Signed, time-bounded authentication tokens.
//!
//! Tokens are compact HS256 JWTs. The claim set carries SHA-256 digests of
//! the application key and secret rather than the raw values, so a token
//! leaked from a log does not reveal credentials.
//!
//! # Validation Order
//!
//! 1. Structure and HMAC signature (constant-time comparison inside the HMAC
//!    verification)
//! 2. Issuer
//! 3. Expiry (`now > exp` is expired)
//!
//! Expiry is only examined after the signature check has run, so forged and
//! expired tokens go through identical verification work; only the returned
//! error kind differs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Minimum signing secret length in bytes.
pub const MIN_SECRET_LEN: usize = 16;

/// Claims carried by an issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
    /// Hex SHA-256 of the application key.
    #[serde(rename = "sub")]
    pub subject: String,
    /// Hex SHA-256 of the application secret.
    pub secret_hash: String,
    #[serde(rename = "iss")]
    pub issuer: String,
    /// Expiry as Unix seconds.
    #[serde(rename = "exp")]
    pub expires_at: i64,
    /// Issue time as Unix seconds.
    #[serde(rename = "iat")]
    pub issued_at: i64,
    /// Unique token id; two tokens for the same subject are never equal.
    pub jti: String,
}

impl AuthClaims {
    /// Whether these claims were issued for `subject_id`.
    pub fn matches_subject(&self, subject_id: &str) -> bool {
        hash_eq(&self.subject, subject_id)
    }

    /// Whether these claims were issued for `secret`.
    pub fn matches_secret(&self, secret: &str) -> bool {
        hash_eq(&self.secret_hash, secret)
    }

    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expires_at, 0)
    }
}

/// A freshly issued token with its claims.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: AuthClaims,
}

/// Issues and validates HS256 tokens with a service-held secret.
#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    expiry: Duration,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("issuer", &self.issuer)
            .field("expiry", &self.expiry)
            .field("encoding_key", &"[REDACTED]")
            .field("decoding_key", &"[REDACTED]")
            .finish()
    }
}

impl TokenCodec {
    /// Create a codec.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the secret is shorter than
    /// [`MIN_SECRET_LEN`] bytes or the issuer is empty.
    pub fn new(secret: &[u8], issuer: impl Into<String>, expiry: Duration) -> AppResult<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(AppError::ConfigError(format!(
                "JWT_SECRET must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        let issuer = issuer.into();
        if issuer.is_empty() {
            return Err(AppError::ConfigError(
                "JWT_ISSUER must not be empty".to_string(),
            ));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked by validate_at against the caller's clock
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_issuer(&[issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            issuer,
            expiry,
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Issue a token for `subject_id` / `secret`, valid from now.
    pub fn issue(&self, subject_id: &str, secret: &str) -> AppResult<IssuedToken> {
        self.issue_at(subject_id, secret, Utc::now())
    }

    /// Issue a token as if the current time were `now`.
    pub fn issue_at(
        &self,
        subject_id: &str,
        secret: &str,
        now: DateTime<Utc>,
    ) -> AppResult<IssuedToken> {
        let issued_at = now.timestamp();
        let lifetime = i64::try_from(self.expiry.as_secs()).unwrap_or(i64::MAX);

        let claims = AuthClaims {
            subject: hash_hex(subject_id),
            secret_hash: hash_hex(secret),
            issuer: self.issuer.clone(),
            expires_at: issued_at.saturating_add(lifetime),
            issued_at,
            jti: Uuid::new_v4().to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AppError::TokenGenerate(e.to_string()))?;

        debug!(jti = %claims.jti, expires_at = claims.expires_at, "Issued token");
        Ok(IssuedToken { token, claims })
    }

    /// Validate a token against the current time.
    pub fn validate(&self, token: &str) -> AppResult<AuthClaims> {
        self.validate_at(token, Utc::now())
    }

    /// Validate a token as if the current time were `now`.
    ///
    /// # Errors
    ///
    /// - `TokenInvalidSignature` for malformed, tampered, foreign-issuer or
    ///   wrongly-signed tokens
    /// - `TokenExpired` when `now` is past the token's expiry
    pub fn validate_at(&self, token: &str, now: DateTime<Utc>) -> AppResult<AuthClaims> {
        let data = decode::<AuthClaims>(token, &self.decoding_key, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => AppError::TokenExpired,
                _ => AppError::TokenInvalidSignature(e.to_string()),
            },
        )?;

        let claims = data.claims;
        if now.timestamp() > claims.expires_at {
            return Err(AppError::TokenExpired);
        }
        Ok(claims)
    }
}

/// Hex-encoded SHA-256 digest.
pub fn hash_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Constant-time comparison of a stored digest against `hash_hex(plain)`.
fn hash_eq(stored_hash: &str, plain: &str) -> bool {
    stored_hash
        .as_bytes()
        .ct_eq(hash_hex(plain).as_bytes())
        .into()
}
