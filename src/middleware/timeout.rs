//! Request deadline enforcement.
//!
//! [`TimeoutLayer`] gives every request a deadline and runs the rest of the
//! chain as its own task. If the deadline passes first the caller gets a
//! single `504` and the handler's [`RequestContext`] is cancelled; whatever
//! the handler produces afterwards is dropped. A handler that panics after
//! its deadline is still logged and alerted through the recovery layer.
//!
//! # Client-Specified Deadlines
//!
//! Clients can ask for a shorter deadline via the `X-Request-Timeout` header:
//! ```text
//! X-Request-Timeout: 5000  # 5 seconds in milliseconds
//! ```
//!
//! The header can only shorten the server timeout, never extend it. Values
//! outside [`MIN_REQUEST_TIMEOUT_MS`]..=[`MAX_REQUEST_TIMEOUT_MS`] or that do
//! not parse are ignored.
//!
//! # Cooperative Cancellation
//!
//! Handlers extract the context and either poll it or wrap slow work:
//! ```rust,ignore
//! async fn handler(ctx: RequestContext) -> AppResult<Json<Report>> {
//!     let report = ctx.run_until_cancelled(build_report()).await?;
//!     Ok(Json(report))
//! }
//! ```
//!
//! The context is also cancelled when the request finishes normally or the
//! connection goes away, so background work tied to it always stops.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Request, Response};
use axum::response::IntoResponse;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use super::recovery::{Fault, LateFaultReporter, catch_fault};
use crate::error::{AppError, AppResult};
use crate::metrics;

/// Minimum allowed request timeout (100ms).
///
/// Prevents clients from requesting unreasonably short timeouts that
/// would cause operations to always fail.
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 100;

/// Maximum allowed request timeout (5 minutes).
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 300_000;

/// Header name for client-specified request timeout.
pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout";

/// Client-requested timeout parsed from `X-Request-Timeout`.
#[derive(Debug, Clone, Copy)]
pub struct RequestTimeout {
    /// The timeout duration specified by the client.
    pub duration: Duration,
    /// The original value from the header (for logging).
    pub original_ms: u64,
}

impl RequestTimeout {
    /// Create a new RequestTimeout from milliseconds.
    ///
    /// Returns `None` if the value is outside the allowed range.
    pub fn from_millis(ms: u64) -> Option<Self> {
        if !(MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS).contains(&ms) {
            return None;
        }
        Some(Self {
            duration: Duration::from_millis(ms),
            original_ms: ms,
        })
    }

    /// Read and validate the header, ignoring anything unusable.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value_str = headers.get(REQUEST_TIMEOUT_HEADER)?.to_str().ok()?;

        let Ok(ms) = value_str.trim().parse::<u64>() else {
            debug!(
                value = value_str,
                "Invalid X-Request-Timeout header value, ignoring"
            );
            return None;
        };

        let timeout = Self::from_millis(ms);
        if timeout.is_none() {
            debug!(
                timeout_ms = ms,
                min = MIN_REQUEST_TIMEOUT_MS,
                max = MAX_REQUEST_TIMEOUT_MS,
                "Client timeout outside allowed range, ignoring"
            );
        }
        timeout
    }
}

/// Deadline and cancellation signal for one request.
///
/// Cloning shares the cancellation token. The `Default` context has no
/// deadline and is only cancelled explicitly; handlers mounted without a
/// [`TimeoutLayer`] receive one of these.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    budget: Option<Duration>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Context whose deadline is `budget` from now.
    pub fn with_budget(budget: Duration) -> Self {
        Self::until(Instant::now() + budget, budget)
    }

    fn until(deadline: Instant, budget: Duration) -> Self {
        Self {
            deadline: Some(deadline),
            budget: Some(budget),
            cancel: CancellationToken::new(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn budget(&self) -> Option<Duration> {
        self.budget
    }

    /// Time left before the deadline; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token cancelled together with this context, for spawned subtasks.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Run `future` unless the context is cancelled first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::RequestTimeout` if cancellation wins; `future` is
    /// dropped at that point.
    pub async fn run_until_cancelled<F: Future>(&self, future: F) -> AppResult<F::Output> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                Err(AppError::RequestTimeout(self.budget.unwrap_or_default()))
            }
            output = future => Ok(output),
        }
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_default())
    }
}

/// Deadline layer for the Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let app = Router::new()
///     .route("/", get(handler))
///     .layer(TimeoutLayer::new(Duration::from_secs(30)));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    timeout: Duration,
}

impl TimeoutLayer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            timeout: self.timeout,
        }
    }
}

/// Deadline service wrapper.
#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    timeout: Duration,
}

impl<S> TimeoutService<S> {
    /// Server timeout, shortened by a valid client header.
    fn budget_for(&self, headers: &HeaderMap) -> Duration {
        match RequestTimeout::from_headers(headers) {
            Some(requested) if requested.duration < self.timeout => {
                debug!(
                    timeout_ms = requested.original_ms,
                    "Client specified request timeout via header"
                );
                requested.duration
            }
            _ => self.timeout,
        }
    }
}

impl<S> Service<Request<Body>> for TimeoutService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let budget = self.budget_for(req.headers());
        let deadline = Instant::now() + budget;
        let ctx = RequestContext::until(deadline, budget);
        let path = req.uri().path().to_owned();
        let late_faults = req.extensions().get::<LateFaultReporter>().cloned();

        req.extensions_mut().insert(ctx.clone());
        let handler = catch_fault(self.inner.call(req));

        Box::pin(async move {
            let _cancel_on_exit = ctx.cancel.clone().drop_guard();
            let mut task = tokio::spawn(handler);

            let finished = tokio::select! {
                biased;
                joined = &mut task => Some(joined),
                () = tokio::time::sleep_until(deadline) => None,
            };

            match finished {
                Some(Ok(Ok(result))) => result,
                // Re-raise so the recovery layer reports it
                Some(Ok(Err(fault))) => std::panic::resume_unwind(Box::new(fault)),
                Some(Err(join_error)) => {
                    std::panic::resume_unwind(Box::new(Fault::from_join_error(join_error)))
                }
                None => {
                    ctx.cancel();
                    warn!(
                        path = %path,
                        timeout_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
                        "Request exceeded its deadline"
                    );
                    metrics::record_request_timeout();
                    tokio::spawn(watch_late_handler(task, late_faults, path));
                    Ok(AppError::RequestTimeout(budget).into_response())
                }
            }
        })
    }
}

/// Wait out a handler whose deadline has passed.
///
/// Its result is dropped; a fault is still reported, through the recovery
/// layer's reporter when one is present.
async fn watch_late_handler<T>(
    task: JoinHandle<Result<T, Fault>>,
    late_faults: Option<LateFaultReporter>,
    path: String,
) {
    let fault = match task.await {
        Ok(Ok(_)) => {
            debug!(path = %path, "Discarded handler result produced after the deadline");
            return;
        }
        Ok(Err(fault)) => fault,
        Err(join_error) => Fault::from_join_error(join_error),
    };

    match late_faults {
        Some(reporter) => reporter.report(&fault),
        None => error!(
            fault = %fault,
            path = %path,
            backtrace = %fault.backtrace,
            "Handler faulted after its deadline"
        ),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, StatusCode};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tower::ServiceExt;

    #[test]
    fn test_request_timeout_from_millis_valid() {
        let timeout = RequestTimeout::from_millis(5000).unwrap();
        assert_eq!(timeout.duration, Duration::from_millis(5000));
        assert_eq!(timeout.original_ms, 5000);
    }

    #[test]
    fn test_request_timeout_from_millis_bounds() {
        assert!(RequestTimeout::from_millis(MIN_REQUEST_TIMEOUT_MS).is_some());
        assert!(RequestTimeout::from_millis(MAX_REQUEST_TIMEOUT_MS).is_some());
        assert!(RequestTimeout::from_millis(MIN_REQUEST_TIMEOUT_MS - 1).is_none());
        assert!(RequestTimeout::from_millis(MAX_REQUEST_TIMEOUT_MS + 1).is_none());
        assert!(RequestTimeout::from_millis(0).is_none());
    }

    #[test]
    fn test_request_timeout_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(RequestTimeout::from_headers(&headers).is_none());

        headers.insert(REQUEST_TIMEOUT_HEADER, HeaderValue::from_static(" 250 "));
        assert_eq!(
            RequestTimeout::from_headers(&headers).unwrap().duration,
            Duration::from_millis(250)
        );

        headers.insert(REQUEST_TIMEOUT_HEADER, HeaderValue::from_static("soon"));
        assert!(RequestTimeout::from_headers(&headers).is_none());
    }

    #[test]
    fn test_header_only_shortens_budget() {
        let service = TimeoutLayer::new(Duration::from_secs(2)).layer(());
        let mut headers = HeaderMap::new();

        headers.insert(REQUEST_TIMEOUT_HEADER, HeaderValue::from_static("500"));
        assert_eq!(service.budget_for(&headers), Duration::from_millis(500));

        headers.insert(REQUEST_TIMEOUT_HEADER, HeaderValue::from_static("10000"));
        assert_eq!(service.budget_for(&headers), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_remaining_and_cancel() {
        let ctx = RequestContext::with_budget(Duration::from_secs(3));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(ctx.remaining(), Some(Duration::from_secs(2)));

        let child = ctx.child_token();
        let clone = ctx.clone();
        ctx.cancel();
        assert!(clone.is_cancelled());
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_default_context_is_unbounded() {
        let ctx = RequestContext::default();
        assert!(ctx.remaining().is_none());
        assert!(!ctx.is_cancelled());
        assert_eq!(ctx.run_until_cancelled(async { 1 }).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_until_cancelled_after_cancel() {
        let ctx = RequestContext::with_budget(Duration::from_secs(1));
        ctx.cancel();
        let result = ctx.run_until_cancelled(std::future::pending::<()>()).await;
        assert!(matches!(result, Err(AppError::RequestTimeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_gets_timeout_and_observes_cancel() {
        let observed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&observed);

        let inner = tower::service_fn(move |req: Request<Body>| {
            let flag = Arc::clone(&flag);
            async move {
                let ctx = req.extensions().get::<RequestContext>().cloned().unwrap();
                if ctx
                    .run_until_cancelled(tokio::time::sleep(Duration::from_secs(10)))
                    .await
                    .is_err()
                {
                    flag.store(true, Ordering::SeqCst);
                }
                Ok::<_, Infallible>(Response::new(Body::from("late")))
            }
        });

        let service = TimeoutLayer::new(Duration::from_secs(1)).layer(inner);
        let response = service
            .oneshot(Request::new(Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        // Let the detached handler task observe the cancellation
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_fast_handler_passes_and_context_is_cancelled_after() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(parking_lot::Mutex::new(Some(tx)));

        let inner = tower::service_fn(move |req: Request<Body>| {
            let tx = Arc::clone(&tx);
            async move {
                let ctx = req.extensions().get::<RequestContext>().cloned().unwrap();
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(ctx);
                }
                Ok::<_, Infallible>(Response::new(Body::from("ok")))
            }
        });

        let service = TimeoutLayer::new(Duration::from_secs(5)).layer(inner);
        let response = service
            .oneshot(Request::new(Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(rx.await.unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn test_handler_panic_is_reraised_as_fault() {
        let inner = tower::service_fn(|_req: Request<Body>| async move {
            if true {
                panic!("handler exploded");
            }
            Ok::<_, Infallible>(Response::new(Body::empty()))
        });

        let service = TimeoutLayer::new(Duration::from_secs(5)).layer(inner);
        let fault = catch_fault(service.oneshot(Request::new(Body::empty())))
            .await
            .unwrap_err();
        assert_eq!(fault.message, "handler exploded");
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_fault_without_reporter_is_contained() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);

        let inner = tower::service_fn(move |_req: Request<Body>| {
            let flag = Arc::clone(&flag);
            async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                flag.store(true, Ordering::SeqCst);
                if true {
                    panic!("too late to matter");
                }
                Ok::<_, Infallible>(Response::new(Body::empty()))
            }
        });

        let service = TimeoutLayer::new(Duration::from_secs(1)).layer(inner);
        let response = service
            .oneshot(Request::new(Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        // The watcher absorbs the fault; the runtime keeps going
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(finished.load(Ordering::SeqCst));
    }
}
