//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Rate Limiting
//!
//! - `RATE_LIMIT_RULES`: `PATTERN=CAPACITY:FILL_RATE[:QUANTUM[:route|client]]`,
//!   comma-separated, first match wins (default: `/auth=10:1:1:client,/api=100:100:1`).
//!   An empty value disables rate limiting.
//! - `BUCKET_IDLE_TTL_SECS` / `BUCKET_SWEEP_INTERVAL_SECS`: idle bucket eviction
//!
//! # Security Configuration
//!
//! - `JWT_SECRET`: HMAC signing key, at least 16 bytes. A development key is
//!   used (with a warning) when unset.
//! - `AUTH_CLIENTS`: `app_key:app_secret` pairs allowed to obtain tokens
//! - `TRUSTED_PROXIES`: CIDR ranges allowed to set `X-Forwarded-For`
//! - `CORS_ALLOWED_ORIGINS`: Comma-separated list of allowed origins (default: `*` for dev)
//!
//! # Resilience
//!
//! - `REQUEST_TIMEOUT_MS`: Handler deadline (default: 60000)
//! - `ALERT_WEBHOOK_URL`: Fault alerts are POSTed here; logged when unset

use std::env;
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::time::Duration;

use crate::auth::codec::MIN_SECRET_LEN;
use crate::error::{AppError, AppResult};
use crate::limiter::{BucketRule, parse_rules};

/// Signing key used when `JWT_SECRET` is not set. Development only.
pub const DEV_JWT_SECRET: &str = "admission-guard-development-secret";

/// Default rate limit rules.
pub const DEFAULT_RATE_LIMIT_RULES: &str = "/auth=10:1:1:client,/api=100:100:1";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}' (expected text or json)")),
        }
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Maximum request body size in bytes (default: 1MB)
    pub max_request_body_size: usize,

    /// Handler deadline; clients may shorten it per request (default: 60s)
    pub request_timeout: Duration,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Ordered bucket rules; empty disables rate limiting
    pub rate_limit_rules: Vec<BucketRule>,

    /// Minimum idle time before a bucket may be evicted (default: 600s)
    pub bucket_idle_ttl: Duration,

    /// Interval between idle bucket sweeps (default: 60s, 0 = disabled)
    pub bucket_sweep_interval: Duration,

    /// Trusted proxy CIDR ranges for IP spoofing mitigation.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,172.16.0.0/12")
    /// Default: Empty (forwarded headers trusted from any peer)
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Token Configuration
    // =========================================================================
    /// HMAC signing key
    pub jwt_secret: String,

    /// `iss` claim written into and required from tokens
    pub jwt_issuer: String,

    /// Token lifetime (default: 2h)
    pub jwt_expiry: Duration,

    /// Application credentials allowed to call `POST /auth`
    pub auth_clients: Vec<(String, String)>,

    /// Auth failures allowed per client IP per minute (default: 10)
    pub auth_failure_limit_per_minute: u32,

    // =========================================================================
    // Alerting Configuration
    // =========================================================================
    /// Webhook receiving fault alerts (None = log only)
    pub alert_webhook_url: Option<String>,

    /// Webhook delivery timeout (default: 10s)
    pub alert_timeout: Duration,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Comma-separated list of allowed CORS origins
    /// Use "*" to allow all origins (not recommended for production)
    pub cors_allowed_origins: Vec<String>,

    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Log output format (default: text)
    pub log_format: LogFormat,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any value fails to parse or the
    /// result does not pass [`Config::validate`].
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        // Callers warn via `uses_dev_secret`; logging may not be set up yet
        let jwt_secret = env::var("JWT_SECRET")
            .ok()
            .filter(|secret| !secret.is_empty())
            .unwrap_or_else(|| DEV_JWT_SECRET.to_string());

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 1024 * 1024)?,
            request_timeout: Duration::from_millis(Self::parse_env("REQUEST_TIMEOUT_MS", 60_000)?),

            // Rate limiting
            rate_limit_rules: Self::parse_rate_limit_rules()?,
            bucket_idle_ttl: Duration::from_secs(Self::parse_env("BUCKET_IDLE_TTL_SECS", 600)?),
            bucket_sweep_interval: Duration::from_secs(Self::parse_env(
                "BUCKET_SWEEP_INTERVAL_SECS",
                60,
            )?),
            trusted_proxies: Self::parse_list("TRUSTED_PROXIES", ""),

            // Tokens
            jwt_secret,
            jwt_issuer: env::var("JWT_ISSUER").unwrap_or_else(|_| "admission-guard".to_string()),
            jwt_expiry: Duration::from_secs(Self::parse_env("JWT_EXPIRE_SECS", 7200)?),
            auth_clients: Self::parse_auth_clients(
                &env::var("AUTH_CLIENTS").unwrap_or_default(),
            )?,
            auth_failure_limit_per_minute: Self::parse_env("AUTH_FAILURE_LIMIT_PER_MINUTE", 10)?,

            // Alerting
            alert_webhook_url: env::var("ALERT_WEBHOOK_URL")
                .ok()
                .filter(|u| !u.trim().is_empty()),
            alert_timeout: Duration::from_secs(Self::parse_env("ALERT_TIMEOUT_SECS", 10)?),

            // Observability
            cors_allowed_origins: Self::parse_list("CORS_ALLOWED_ORIGINS", "*"),
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: Self::parse_env("LOG_FORMAT", LogFormat::Text)?,
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        if self.jwt_secret.len() < MIN_SECRET_LEN {
            return Err(AppError::ConfigError(format!(
                "JWT_SECRET must be at least {MIN_SECRET_LEN} bytes"
            )));
        }

        if self.jwt_issuer.trim().is_empty() {
            return Err(AppError::ConfigError(
                "JWT_ISSUER must not be empty".to_string(),
            ));
        }

        if self.jwt_expiry.is_zero() {
            return Err(AppError::ConfigError(
                "JWT_EXPIRE_SECS must be greater than 0".to_string(),
            ));
        }

        if self.auth_failure_limit_per_minute == 0 {
            return Err(AppError::ConfigError(
                "AUTH_FAILURE_LIMIT_PER_MINUTE must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "REQUEST_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        // Validate max request body size is reasonable
        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        if let Some(url) = &self.alert_webhook_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            return Err(AppError::ConfigError(format!(
                "ALERT_WEBHOOK_URL must be an http(s) URL, got '{url}'"
            )));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if rate limiting is enabled.
    pub fn rate_limiting_enabled(&self) -> bool {
        !self.rate_limit_rules.is_empty()
    }

    /// Check if the idle bucket sweeper should run.
    pub fn bucket_sweep_enabled(&self) -> bool {
        !self.bucket_sweep_interval.is_zero()
    }

    /// Auth failure quota; `validate` guarantees it is non-zero.
    pub fn auth_failure_quota(&self) -> NonZeroU32 {
        NonZeroU32::new(self.auth_failure_limit_per_minute)
            .unwrap_or(crate::middleware::auth::DEFAULT_AUTH_FAILURE_LIMIT)
    }

    /// Check if the development signing key is in use.
    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse a comma-separated list, dropping blank entries.
    fn parse_list(name: &str, default: &str) -> Vec<String> {
        env::var(name)
            .unwrap_or_else(|_| default.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Parse `RATE_LIMIT_RULES`; set-but-empty disables limiting.
    fn parse_rate_limit_rules() -> AppResult<Vec<BucketRule>> {
        let raw = env::var("RATE_LIMIT_RULES")
            .unwrap_or_else(|_| DEFAULT_RATE_LIMIT_RULES.to_string());
        parse_rules(&raw)
            .map_err(|e| AppError::ConfigError(format!("Invalid RATE_LIMIT_RULES: {e}")))
    }

    /// Parse `key:secret` pairs.
    ///
    /// The secret may itself contain `:`; only the first one separates.
    pub fn parse_auth_clients(raw: &str) -> AppResult<Vec<(String, String)>> {
        raw.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| match entry.split_once(':') {
                Some((key, secret)) if !key.trim().is_empty() && !secret.is_empty() => {
                    Ok((key.trim().to_string(), secret.to_string()))
                }
                _ => Err(AppError::ConfigError(format!(
                    "Invalid AUTH_CLIENTS entry '{}': expected key:secret",
                    entry.split(':').next().unwrap_or_default()
                ))),
            })
            .collect()
    }
}

/// Secrets are redacted.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let client_keys: Vec<&str> = self.auth_clients.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("max_request_body_size", &self.max_request_body_size)
            .field("request_timeout", &self.request_timeout)
            .field("rate_limit_rules", &self.rate_limit_rules)
            .field("bucket_idle_ttl", &self.bucket_idle_ttl)
            .field("bucket_sweep_interval", &self.bucket_sweep_interval)
            .field("trusted_proxies", &self.trusted_proxies)
            .field("jwt_secret", &"[REDACTED]")
            .field("jwt_issuer", &self.jwt_issuer)
            .field("jwt_expiry", &self.jwt_expiry)
            .field("auth_clients", &client_keys)
            .field(
                "auth_failure_limit_per_minute",
                &self.auth_failure_limit_per_minute,
            )
            .field("alert_webhook_url", &self.alert_webhook_url)
            .field("alert_timeout", &self.alert_timeout)
            .field("cors_allowed_origins", &self.cors_allowed_origins)
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .field("metrics_port", &self.metrics_port)
            .finish()
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_request_body_size: 1024 * 1024,
            request_timeout: Duration::from_secs(60),
            // Rate limiting
            rate_limit_rules: parse_rules(DEFAULT_RATE_LIMIT_RULES).unwrap_or_default(),
            bucket_idle_ttl: Duration::from_secs(600),
            bucket_sweep_interval: Duration::from_secs(60),
            trusted_proxies: vec![],
            // Tokens
            jwt_secret: DEV_JWT_SECRET.to_string(),
            jwt_issuer: "admission-guard".to_string(),
            jwt_expiry: Duration::from_secs(7200),
            auth_clients: vec![],
            auth_failure_limit_per_minute: 10,
            // Alerting
            alert_webhook_url: None,
            alert_timeout: Duration::from_secs(10),
            // Observability
            cors_allowed_origins: vec!["*".to_string()],
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            metrics_port: 9090,
        }
    }
}
