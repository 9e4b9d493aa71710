//! Rate limiting middleware backed by the token-bucket registry.
//!
//! # Decision Procedure
//!
//! 1. Match the request path against the configured rules, in order; the
//!    first rule whose prefix matches wins. Unmatched paths are exempt.
//! 2. Resolve the bucket key: the rule pattern for route-scoped rules,
//!    `pattern#client-ip` for client-scoped rules.
//! 3. Take `quantum` tokens from the key's bucket. If the bucket is short,
//!    reject immediately. There is no queueing or delayed retry.
//!
//! # Response Headers
//!
//! On rate limit exceeded (429):
//! - `X-RateLimit-Limit`: Bucket capacity of the matched rule
//! - `X-RateLimit-Remaining`: Always `0`
//!
//! # IP Spoofing Mitigation
//!
//! Client-scoped rules key on the client IP, which may come from
//! `X-Forwarded-For` when behind a reverse proxy. Configure
//! `TRUSTED_PROXIES` so forwarded headers from other peers are ignored; see
//! [`super::ip::client_ip`].

use std::future::{Future, ready};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderValue, Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::{trace, warn};

use super::ip::{TrustedProxyConfig, client_ip};
use crate::error::AppError;
use crate::limiter::{BucketRegistry, BucketRule, RuleScope, match_rule};
use crate::metrics;

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Rate limiting layer for the Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let rules = parse_rules("/auth=10:1:1:client,/api=100:100")?;
/// let layer = RateLimitLayer::new(rules, BucketRegistry::new(), TrustedProxyConfig::default());
/// let app = Router::new()
///     .route("/api", get(handler))
///     .layer(layer);
/// ```
#[derive(Clone)]
pub struct RateLimitLayer {
    rules: Arc<[BucketRule]>,
    registry: BucketRegistry,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl RateLimitLayer {
    /// Create a rate limit layer over `registry`.
    ///
    /// The registry is shared, so the application state can sweep idle
    /// buckets while the layer is serving.
    pub fn new(
        rules: impl Into<Arc<[BucketRule]>>,
        registry: BucketRegistry,
        trusted_proxies: TrustedProxyConfig,
    ) -> Self {
        Self {
            rules: rules.into(),
            registry,
            trusted_proxies: Arc::new(trusted_proxies),
        }
    }

    pub fn rules(&self) -> &[BucketRule] {
        &self.rules
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            rules: Arc::clone(&self.rules),
            registry: self.registry.clone(),
            trusted_proxies: Arc::clone(&self.trusted_proxies),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    rules: Arc<[BucketRule]>,
    registry: BucketRegistry,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl<S> RateLimitService<S> {
    /// Decide admission for `req`; `Err` carries the rejection response.
    fn admit(&self, req: &Request<Body>) -> Result<(), Response<Body>> {
        let path = req.uri().path();
        let Some(rule) = match_rule(&self.rules, path) else {
            return Ok(());
        };

        let key = match rule.scope() {
            RuleScope::Route => rule.resolve_key(""),
            RuleScope::Client => rule.resolve_key(&client_ip(req, &self.trusted_proxies)),
        };

        if self.registry.try_consume(&key, rule) > 0 {
            trace!(key = %key, "Request admitted");
            return Ok(());
        }

        warn!(
            key = %key,
            path = %path,
            capacity = rule.capacity(),
            "Rate limit exceeded"
        );
        metrics::record_rate_limited(rule.key_pattern());

        let mut response = AppError::RateLimitExceeded(key).into_response();
        let headers = response.headers_mut();
        headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(rule.capacity()));
        headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from_static("0"));
        Err(response)
    }
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        match self.admit(&req) {
            Ok(()) => Box::pin(self.inner.call(req)),
            Err(rejection) => Box::pin(ready(Ok(rejection))),
        }
    }
}
