//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← Sets / echoes X-Request-Id
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response spans, duration histogram
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │    Recovery      │ ← 500 + alert on panic
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │    Timeout       │ ← 504 past the deadline
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Rate Limiting   │ ← 429 if the matched bucket is empty
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  CORS, body size │
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Bearer Auth    │ ← 401 / 429, protected routes only
//! └────────┬─────────┘
//!          ▼
//!      Handler
//! ```
//!
//! # Route Groups
//!
//! - `/health` - Health check (no token)
//! - `/auth` - Token issuance (no token)
//! - `/api/v1/*` - Protected API

use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::DefaultBodyLimit;
use axum::http::{Request, Response};
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{Span, debug, info, info_span};

use crate::handlers;
use crate::metrics;
use crate::middleware::{
    BearerAuth, REQUEST_ID_HEADER, RateLimitLayer, RecoveryLayer, TimeoutLayer,
    TrustedProxyConfig,
};
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
///
/// # Middleware Configuration
///
/// - **Rate Limiting**: Enabled if `RATE_LIMIT_RULES` is non-empty
/// - **Bearer Auth**: Always on for `/api/v1/*`
/// - **CORS**: Configured from `cors_allowed_origins`
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;

    // =========================================================================
    // Protected routes
    // =========================================================================
    let bearer_auth = BearerAuth::new(
        state.codec.clone(),
        config.auth_failure_quota(),
        TrustedProxyConfig::new(&config.trusted_proxies),
    );
    let protected = Router::new()
        .route("/api/v1/whoami", get(handlers::whoami))
        .route_layer(bearer_auth);

    // =========================================================================
    // Build Router with Routes
    // =========================================================================
    let router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/auth", post(handlers::issue_token))
        .merge(protected);

    // Request body size limit (prevents DoS via large payloads)
    info!(
        max_size_bytes = config.max_request_body_size,
        "Request body size limit configured"
    );
    let router = router
        .layer(DefaultBodyLimit::max(config.max_request_body_size))
        .layer(build_cors_layer(&config.cors_allowed_origins));

    apply_guards(router, &state).with_state(state)
}

/// Wrap `router` in the admission and resilience layers.
///
/// Public so services embedding these guards can apply the same stack to
/// their own routes.
pub fn apply_guards<S>(router: Router<S>, state: &AppState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let config = &state.config;

    // Applied innermost first: each layer wraps everything added before it
    let router = if config.rate_limiting_enabled() {
        info!(
            rules = config.rate_limit_rules.len(),
            trusted_proxies = config.trusted_proxies.len(),
            "Rate limiting enabled"
        );
        router.layer(RateLimitLayer::new(
            config.rate_limit_rules.clone(),
            state.registry.clone(),
            TrustedProxyConfig::new(&config.trusted_proxies),
        ))
    } else {
        info!("Rate limiting disabled (RATE_LIMIT_RULES is empty)");
        router
    };

    info!(
        timeout_ms = u64::try_from(config.request_timeout.as_millis()).unwrap_or(u64::MAX),
        "Request timeout configured"
    );

    router
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(RecoveryLayer::new(
            state.alert_sink.clone(),
            state.task_tracker().clone(),
        ))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request<Body>| {
                    let request_id = req
                        .headers()
                        .get(REQUEST_ID_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default();
                    info_span!(
                        "request",
                        method = %req.method(),
                        uri = %req.uri(),
                        request_id = %request_id,
                    )
                })
                .on_response(|res: &Response<Body>, latency: Duration, _span: &Span| {
                    metrics::record_request_duration(res.status().as_u16(), latency.as_secs_f64());
                    debug!(
                        status = res.status().as_u16(),
                        latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                        "Finished processing request"
                    );
                }),
        )
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// Build CORS layer from configuration.
///
/// # Arguments
///
/// * `allowed_origins` - List of allowed origins, or `["*"]` for any origin
///
/// # Security Note
///
/// Using `*` (any origin) is convenient for development but should be
/// avoided in production. Specify explicit origins instead.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
