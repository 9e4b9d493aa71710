//! End-to-end tests for the admission pipeline.
//!
//! The assembled router is driven in-process with `tower::ServiceExt::oneshot`;
//! no sockets are opened. Without connection info the client IP comes from
//! `X-Forwarded-For`, which lets tests act as different callers.
//!
//! Run with: `cargo test --test pipeline_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use admission_guard::alert::{Alert, AlertError, AlertSink};
use admission_guard::auth::hash_hex;
use admission_guard::error::codes;
use admission_guard::limiter::parse_rules;
use admission_guard::{AppState, Config, RequestContext, apply_guards, build_router};
use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::routing::get;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower::ServiceExt;

// =============================================================================
// Helpers
// =============================================================================

fn test_config() -> Config {
    Config {
        jwt_secret: "pipeline-test-secret-0123456789".to_string(),
        auth_clients: vec![("blog".to_string(), "s3cret".to_string())],
        bucket_sweep_interval: Duration::ZERO,
        metrics_port: 0,
        ..Config::default()
    }
}

fn with_rules(rules: &str) -> Config {
    Config {
        rate_limit_rules: parse_rules(rules).unwrap(),
        ..test_config()
    }
}

/// Forwards every alert to a channel.
struct ChannelSink(mpsc::UnboundedSender<Alert>);

#[async_trait]
impl AlertSink for ChannelSink {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        self.0
            .send(alert.clone())
            .map_err(|e| AlertError::Delivery(e.to_string()))
    }
}

struct FailingSink;

#[async_trait]
impl AlertSink for FailingSink {
    async fn send(&self, _alert: &Alert) -> Result<(), AlertError> {
        Err(AlertError::Rejected(503))
    }
}

struct PanickingSink;

#[async_trait]
impl AlertSink for PanickingSink {
    async fn send(&self, _alert: &Alert) -> Result<(), AlertError> {
        panic!("alert sink is broken");
    }
}

fn get_req(uri: &str, client_ip: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-forwarded-for", client_ip)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, client_ip: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-forwarded-for", client_ip)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn issue(app: &Router, app_key: &str, app_secret: &str) -> Response {
    app.clone()
        .oneshot(post_json(
            "/auth",
            "10.0.0.1",
            json!({ "app_key": app_key, "app_secret": app_secret }),
        ))
        .await
        .unwrap()
}

/// Routes with a panicking handler, guarded like the real ones.
fn panic_routes(state: &AppState) -> Router {
    let routes = Router::new()
        .route(
            "/api/explode",
            get(|| async {
                if true {
                    panic!("database exploded");
                }
                "unreachable"
            }),
        )
        .route("/health", get(|| async { "ok" }));
    apply_guards(routes, state)
}

// =============================================================================
// Health and request ids
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let state = AppState::new(test_config()).unwrap();
    let app = build_router(state.clone());

    let response = app.oneshot(get_req("/health", "1.1.1.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

    state.shutdown().await;
}

#[tokio::test]
async fn test_request_id_is_propagated() {
    let state = AppState::new(test_config()).unwrap();
    let app = build_router(state.clone());

    let request = Request::builder()
        .uri("/health")
        .header("x-request-id", "caller-chosen-id")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.headers()["x-request-id"], "caller-chosen-id");

    state.shutdown().await;
}

// =============================================================================
// Rate limiting
// =============================================================================

#[tokio::test]
async fn test_rate_limit_rejects_after_capacity() {
    let state = AppState::new(with_rules("/api=2:0.001")).unwrap();
    let app = build_router(state.clone());

    // Admitted requests reach bearer auth and fail there
    for _ in 0..2 {
        let response = app.clone().oneshot(get_req("/api/v1/whoami", "1.1.1.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = app.oneshot(get_req("/api/v1/whoami", "1.1.1.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["x-ratelimit-limit"], "2");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "0");

    let body = json_body(response).await;
    assert_eq!(body["code"], codes::TOO_MANY_REQUESTS);

    state.shutdown().await;
}

#[tokio::test]
async fn test_unmatched_routes_are_not_limited() {
    let state = AppState::new(with_rules("/api=1:0.001")).unwrap();
    let app = build_router(state.clone());

    for _ in 0..20 {
        let response = app.clone().oneshot(get_req("/health", "1.1.1.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert!(state.registry.is_empty());

    state.shutdown().await;
}

#[tokio::test]
async fn test_client_scoped_buckets_are_independent() {
    let state = AppState::new(with_rules("/auth=1:0.001:1:client")).unwrap();
    let app = build_router(state.clone());
    let creds = json!({ "app_key": "blog", "app_secret": "s3cret" });

    let first = app.clone().oneshot(post_json("/auth", "1.1.1.1", creds.clone())).await.unwrap();
    let other = app.clone().oneshot(post_json("/auth", "2.2.2.2", creds.clone())).await.unwrap();
    let again = app.oneshot(post_json("/auth", "1.1.1.1", creds)).await.unwrap();

    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(other.status(), StatusCode::OK);
    assert_eq!(again.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(state.registry.len(), 2);

    state.shutdown().await;
}

// =============================================================================
// Token issuance and bearer auth
// =============================================================================

#[tokio::test]
async fn test_issue_and_use_token() {
    let state = AppState::new(test_config()).unwrap();
    let app = build_router(state.clone());

    let response = issue(&app, "blog", "s3cret").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["expires_in"], 7200);
    let token = body["token"].as_str().unwrap().to_string();

    let request = Request::builder()
        .uri("/api/v1/whoami")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["subject"], hash_hex("blog"));
    assert_eq!(body["issuer"], "admission-guard");

    state.shutdown().await;
}

#[tokio::test]
async fn test_unknown_credentials_rejected() {
    let state = AppState::new(test_config()).unwrap();
    let app = build_router(state.clone());

    let response = issue(&app, "blog", "wrong").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        json_body(response).await["code"],
        codes::UNAUTHORIZED_AUTH_NOT_EXIST
    );

    state.shutdown().await;
}

#[tokio::test]
async fn test_malformed_auth_body_is_bad_request() {
    let state = AppState::new(test_config()).unwrap();
    let app = build_router(state.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/auth")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], codes::INVALID_PARAMS);

    let response = issue(&app, "", "").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    state.shutdown().await;
}

#[tokio::test]
async fn test_missing_invalid_and_expired_tokens() {
    let state = AppState::new(test_config()).unwrap();
    let app = build_router(state.clone());

    let response = app.clone().oneshot(get_req("/api/v1/whoami", "3.3.3.3")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        json_body(response).await["code"],
        codes::UNAUTHORIZED_TOKEN_MISSING
    );

    let request = Request::builder()
        .uri("/api/v1/whoami")
        .header("x-forwarded-for", "3.3.3.3")
        .header("token", "garbage.token.value")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        json_body(response).await["code"],
        codes::UNAUTHORIZED_TOKEN_ERROR
    );

    let expired = state
        .codec
        .issue_at("blog", "s3cret", Utc::now() - chrono::Duration::hours(3))
        .unwrap();
    let request = Request::builder()
        .uri(format!("/api/v1/whoami?token={}", expired.token))
        .header("x-forwarded-for", "3.3.3.3")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        json_body(response).await["code"],
        codes::UNAUTHORIZED_TOKEN_TIMEOUT
    );

    state.shutdown().await;
}

#[tokio::test]
async fn test_token_from_other_issuer_is_invalid() {
    let state = AppState::new(test_config()).unwrap();
    let other = AppState::new(Config {
        jwt_issuer: "someone-else".to_string(),
        ..test_config()
    })
    .unwrap();
    let app = build_router(state.clone());

    let foreign = other.codec.issue("blog", "s3cret").unwrap();
    let request = Request::builder()
        .uri("/api/v1/whoami")
        .header("authorization", format!("Bearer {}", foreign.token))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    state.shutdown().await;
    other.shutdown().await;
}

// =============================================================================
// Timeouts
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_slow_handler_times_out_once() {
    let state = AppState::new(Config {
        request_timeout: Duration::from_secs(1),
        ..test_config()
    })
    .unwrap();

    let observed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&observed);
    let routes = Router::new().route(
        "/api/slow",
        get(move |ctx: RequestContext| {
            let flag = Arc::clone(&flag);
            async move {
                match ctx
                    .run_until_cancelled(tokio::time::sleep(Duration::from_secs(30)))
                    .await
                {
                    Ok(()) => "finished",
                    Err(_) => {
                        flag.store(true, Ordering::SeqCst);
                        "cancelled"
                    }
                }
            }
        }),
    );
    let app = apply_guards(routes, &state);

    let response = app.oneshot(get_req("/api/slow", "1.1.1.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(json_body(response).await["code"], codes::REQUEST_TIMEOUT);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(observed.load(Ordering::SeqCst));

    state.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_client_header_shortens_deadline() {
    let state = AppState::new(Config {
        request_timeout: Duration::from_secs(5),
        ..test_config()
    })
    .unwrap();

    let routes = Router::new().route(
        "/api/sleepy",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            "done"
        }),
    );
    let app = apply_guards(routes, &state);

    let response = app.clone().oneshot(get_req("/api/sleepy", "1.1.1.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder()
        .uri("/api/sleepy")
        .header("x-request-timeout", "200")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

    state.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_uncooperative_handler_late_body_is_discarded() {
    let state = AppState::new(Config {
        request_timeout: Duration::from_secs(1),
        ..test_config()
    })
    .unwrap();

    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);
    let routes = Router::new().route(
        "/api/stubborn",
        get(move || {
            let flag = Arc::clone(&flag);
            async move {
                // Ignores its RequestContext entirely
                tokio::time::sleep(Duration::from_secs(3)).await;
                flag.store(true, Ordering::SeqCst);
                "late body"
            }
        }),
    );
    let app = apply_guards(routes, &state);

    let response = app.oneshot(get_req("/api/stubborn", "1.1.1.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let body = json_body(response).await;
    assert_eq!(body["code"], codes::REQUEST_TIMEOUT);
    assert!(!body.to_string().contains("late body"));
    assert!(!finished.load(Ordering::SeqCst));

    // The handler runs to completion in the background; nothing else is sent
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(finished.load(Ordering::SeqCst));

    state.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_panic_after_deadline_is_still_alerted() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let state = AppState::with_alert_sink(
        Config {
            request_timeout: Duration::from_millis(100),
            ..test_config()
        },
        Arc::new(ChannelSink(tx)),
    )
    .unwrap();

    let routes = Router::new().route(
        "/api/late-explosion",
        get(|| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            if true {
                panic!("exploded after the deadline");
            }
            "unreachable"
        }),
    );
    let app = apply_guards(routes, &state);

    let request = Request::builder()
        .uri("/api/late-explosion")
        .header("x-request-id", "req-late-1")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

    let alert = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("late fault should be alerted")
        .expect("channel open");
    assert_eq!(alert.message, "exploded after the deadline");
    assert_eq!(alert.path, "/api/late-explosion");
    assert_eq!(alert.request_id.as_deref(), Some("req-late-1"));
    assert!(rx.try_recv().is_err());

    state.shutdown().await;
}

// =============================================================================
// Recovery and alerting
// =============================================================================

#[tokio::test]
async fn test_panic_yields_generic_500_and_alert() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let state = AppState::with_alert_sink(test_config(), Arc::new(ChannelSink(tx))).unwrap();
    let app = panic_routes(&state);

    let request = Request::builder()
        .uri("/api/explode")
        .header("x-request-id", "req-explode-1")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let body = json_body(response).await;
    assert_eq!(body["code"], codes::SERVER_ERROR);
    assert!(!body.to_string().contains("database exploded"));

    let alert = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("alert should be dispatched")
        .expect("channel open");
    assert_eq!(alert.message, "database exploded");
    assert_eq!(alert.path, "/api/explode");
    assert_eq!(alert.request_id.as_deref(), Some("req-explode-1"));
    assert!(alert.subject.contains(&alert.timestamp.to_string()));

    // Exactly one alert for one fault
    assert!(rx.try_recv().is_err());

    // The service keeps serving
    let response = app.oneshot(get_req("/health", "1.1.1.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    state.shutdown().await;
}

#[tokio::test]
async fn test_failing_alert_sink_does_not_affect_responses() {
    let state = AppState::with_alert_sink(test_config(), Arc::new(FailingSink)).unwrap();
    let app = panic_routes(&state);

    let response = app.clone().oneshot(get_req("/api/explode", "1.1.1.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    state.shutdown().await;
    let response = app.oneshot(get_req("/health", "1.1.1.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_panicking_alert_sink_is_contained() {
    let state = AppState::with_alert_sink(test_config(), Arc::new(PanickingSink)).unwrap();
    let app = panic_routes(&state);

    for _ in 0..3 {
        let response = app.clone().oneshot(get_req("/api/explode", "1.1.1.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    // Alert tasks finish (by catching their own panic) rather than hanging
    tokio::time::timeout(Duration::from_secs(5), state.shutdown())
        .await
        .expect("alert tasks should complete");
}
