//! Admission and resilience middleware.
//!
//! - **Recovery**: panics anywhere below become a generic 500 plus an alert
//! - **Timeout**: per-request deadline with cooperative cancellation
//! - **Rate Limiting**: per-key token buckets selected by route rules
//! - **Bearer Auth**: JWT validation on protected routes
//! - **Client IP**: trusted-proxy aware client address resolution
//!
//! # Architecture
//!
//! ```text
//! Request → Recovery → Timeout → Rate Limiter → (Bearer Auth) → Handler
//!              ↓          ↓           ↓               ↓
//!            500        504         429            401 / 429
//! ```
//!
//! Request ids (`X-Request-Id`) are set and echoed by `tower-http` outside
//! this chain, so every guard can log them.

pub mod auth;
pub mod ip;
pub mod rate_limit;
pub mod recovery;
pub mod timeout;

/// Request id header set by the outermost layer.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub use auth::BearerAuth;
pub use ip::{CidrRange, TrustedProxyConfig, UNKNOWN_IP, client_ip};
pub use rate_limit::RateLimitLayer;
pub use recovery::{Fault, RecoveryLayer, catch_fault, install_panic_hook};
pub use timeout::{
    MAX_REQUEST_TIMEOUT_MS, MIN_REQUEST_TIMEOUT_MS, REQUEST_TIMEOUT_HEADER, RequestContext,
    RequestTimeout, TimeoutLayer,
};
