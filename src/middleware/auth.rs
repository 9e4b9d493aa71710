//! Bearer token authentication middleware.
//!
//! # Token Sources
//!
//! Checked in order:
//!
//! ```bash
//! # Authorization header (preferred)
//! curl -H "Authorization: Bearer $TOKEN" http://localhost:3000/api/v1/whoami
//!
//! # Plain token header
//! curl -H "token: $TOKEN" http://localhost:3000/api/v1/whoami
//!
//! # Query parameter (deprecated)
//! curl "http://localhost:3000/api/v1/whoami?token=$TOKEN"
//! ```
//!
//! # Outcomes
//!
//! - No token: `401` with the token-missing code
//! - Bad signature, wrong issuer, malformed: `401` with the invalid-token code
//! - Valid signature but past `exp`: `401` with the expired-token code
//! - Valid: [`AuthClaims`] are inserted into request extensions
//!
//! # Brute Force Protection
//!
//! Every failure is charged to the caller's IP in a per-minute quota. Once
//! the quota is spent, failures answer `429` instead of `401` until it
//! refills. Successful requests are never charged.
//!
//! The layer is meant for `Router::route_layer` on the protected group only;
//! it does no path bypassing of its own.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderValue, Request, Response, header};
use axum::response::IntoResponse;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use super::ip::{TrustedProxyConfig, client_ip};
use crate::auth::TokenCodec;
use crate::error::AppError;
use crate::metrics;

/// Header name for the plain token header.
pub const TOKEN_HEADER: &str = "token";

/// Query parameter name for the token.
pub const TOKEN_QUERY: &str = "token";

/// Default maximum auth failures per IP per minute.
pub const DEFAULT_AUTH_FAILURE_LIMIT: NonZeroU32 = NonZeroU32::new(10).unwrap();

/// Type alias for auth failure rate limiter (per-IP).
type AuthFailureLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Bearer token authentication layer.
#[derive(Clone)]
pub struct BearerAuth {
    codec: Arc<TokenCodec>,
    failure_limiter: Arc<AuthFailureLimiter>,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl BearerAuth {
    /// Create a bearer auth layer.
    ///
    /// # Arguments
    ///
    /// * `codec` - Validates presented tokens
    /// * `failures_per_minute` - Auth failures allowed per IP before `429`
    /// * `trusted_proxies` - Controls which peers may set the client IP
    pub fn new(
        codec: Arc<TokenCodec>,
        failures_per_minute: NonZeroU32,
        trusted_proxies: TrustedProxyConfig,
    ) -> Self {
        Self {
            codec,
            failure_limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(failures_per_minute))),
            trusted_proxies: Arc::new(trusted_proxies),
        }
    }
}

impl<S> Layer<S> for BearerAuth {
    type Service = BearerAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BearerAuthService {
            inner,
            auth: self.clone(),
        }
    }
}

/// Bearer auth service wrapper.
#[derive(Clone)]
pub struct BearerAuthService<S> {
    inner: S,
    auth: BearerAuth,
}

impl BearerAuth {
    /// Turn a validation failure into the response for this caller.
    fn reject<B>(&self, req: &Request<B>, err: AppError) -> Response<Body> {
        let kind = match err {
            AppError::TokenMissing => "missing",
            AppError::TokenExpired => "expired",
            _ => "invalid",
        };
        metrics::record_auth_failure(kind);

        let ip = client_ip(req, &self.trusted_proxies).into_owned();
        if self.failure_limiter.check_key(&ip).is_err() {
            error!(
                client_ip = %ip,
                path = %req.uri().path(),
                "IP blocked due to excessive auth failures"
            );
            return AppError::RateLimitExceeded(format!("auth-failures#{ip}")).into_response();
        }

        warn!(
            client_ip = %ip,
            path = %req.uri().path(),
            kind,
            "Bearer token rejected"
        );

        let mut response = err.into_response();
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        response
    }
}

impl<S> Service<Request<Body>> for BearerAuthService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let validated = match extract_token(&req) {
            Some(extracted) => self.auth.codec.validate(&extracted.token).inspect(|_| {
                debug!(
                    from_query = extracted.from_query,
                    "Bearer token authentication successful"
                );
            }),
            None => Err(AppError::TokenMissing),
        };

        match validated {
            Ok(claims) => {
                req.extensions_mut().insert(claims);
                Box::pin(self.inner.call(req))
            }
            Err(err) => {
                let response = self.auth.reject(&req, err);
                Box::pin(std::future::ready(Ok(response)))
            }
        }
    }
}

/// Token pulled from a request with metadata about the source.
struct ExtractedToken {
    token: String,
    from_query: bool,
}

/// Extract the token from a request.
///
/// Checks in order:
/// 1. `Authorization: Bearer <token>` header
/// 2. `token` header
/// 3. `token` query parameter (deprecated, logs warning)
///
/// # Security Warning
///
/// Query parameter tokens end up in server logs, browser history and proxy
/// caches. They are accepted for older clients only.
fn extract_token<B>(req: &Request<B>) -> Option<ExtractedToken> {
    if let Some(value) = req.headers().get(header::AUTHORIZATION)
        && let Ok(value) = value.to_str()
        && let Some((scheme, token)) = value.trim().split_once(' ')
        && scheme.eq_ignore_ascii_case("bearer")
        && !token.trim().is_empty()
    {
        return Some(ExtractedToken {
            token: token.trim().to_string(),
            from_query: false,
        });
    }

    if let Some(value) = req.headers().get(TOKEN_HEADER)
        && let Ok(value) = value.to_str()
        && !value.trim().is_empty()
    {
        return Some(ExtractedToken {
            token: value.trim().to_string(),
            from_query: false,
        });
    }

    let query = req.uri().query()?;
    let token = query.split('&').find_map(|pair| {
        pair.split_once('=')
            .filter(|(key, value)| *key == TOKEN_QUERY && !value.is_empty())
            .map(|(_, value)| value)
    })?;

    warn!(
        path = %req.uri().path(),
        "DEPRECATED: token provided via query parameter. \
         Use the Authorization header instead."
    );
    Some(ExtractedToken {
        token: token.to_string(),
        from_query: true,
    })
}
