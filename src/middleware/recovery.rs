//! Fault boundary middleware.
//!
//! Wraps the whole request chain so that a panic anywhere below it becomes a
//! generic 500 response instead of tearing down the connection task.
//!
//! # On a Caught Fault
//!
//! 1. The call stack captured at the panic site is logged at error level
//! 2. An [`Alert`] (message, Unix timestamp, request id, path) is handed to the
//!    configured [`AlertSink`] on a tracked background task
//! 3. The caller receives `500` with the generic internal-error code; the
//!    fault message never leaves the process
//!
//! Alert delivery failures, including a panicking sink, are logged with
//! `severity = "critical"` and otherwise ignored.
//!
//! # Stack Capture
//!
//! By the time `catch_unwind` returns, the stack has already unwound. A
//! process-wide panic hook (installed once by [`RecoveryLayer::new`]) records
//! the backtrace and location on the panicking thread, and [`Fault::from_panic`]
//! picks it up on that same thread. Faults that cross a task boundary travel
//! as a [`Fault`] payload and keep their original backtrace.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, PanicHookInfo};
use std::sync::{Arc, Once};
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use futures::FutureExt;
use tokio::task::JoinError;
use tokio_util::task::TaskTracker;
use tower::{Layer, Service};
use tracing::{debug, error};

use super::REQUEST_ID_HEADER;
use crate::alert::{Alert, AlertSink};
use crate::error::AppError;
use crate::metrics;

/// Where and how a panic happened, recorded by the panic hook.
struct PanicSite {
    location: Option<String>,
    backtrace: Backtrace,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicSite>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Install the backtrace-recording panic hook (idempotent).
///
/// The previously installed hook still runs afterwards.
pub fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
            let site = PanicSite {
                location: info.location().map(ToString::to_string),
                backtrace: Backtrace::force_capture(),
            };
            LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(site));
            previous(info);
        }));
    });
}

/// A caught panic with its message and call-stack snapshot.
#[derive(Debug, Clone)]
pub struct Fault {
    pub message: String,
    pub location: Option<String>,
    pub backtrace: String,
}

impl Fault {
    /// Convert a `catch_unwind` payload into a fault.
    ///
    /// Must be called on the thread that caught the panic, right after the
    /// guarded poll, so the stack recorded by the panic hook belongs to this
    /// payload. [`catch_fault`] and [`RecoveryLayer`] clear the record before
    /// every guarded poll.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let site = LAST_PANIC.with(|slot| slot.borrow_mut().take());
        Self::from_payload(payload, site)
    }

    /// Convert a failed handler task into a fault.
    ///
    /// The task panicked on another thread, so no recorded stack applies.
    pub fn from_join_error(err: JoinError) -> Self {
        if err.is_panic() {
            return Self::from_payload(err.into_panic(), None);
        }
        Self {
            message: format!("handler task aborted: {err}"),
            location: None,
            backtrace: Backtrace::force_capture().to_string(),
        }
    }

    fn from_payload(payload: Box<dyn Any + Send>, site: Option<PanicSite>) -> Self {
        let payload = match payload.downcast::<Fault>() {
            Ok(fault) => return *fault,
            Err(other) => other,
        };

        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown fault".to_string()
        };

        match site {
            Some(site) => Self {
                message,
                location: site.location,
                backtrace: site.backtrace.to_string(),
            },
            None => Self {
                message,
                location: None,
                backtrace: Backtrace::force_capture().to_string(),
            },
        }
    }
}

/// Forget any panic recorded on this thread by an earlier, unrelated poll.
fn clear_panic_site() {
    LAST_PANIC.with(|slot| slot.borrow_mut().take());
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} at {}", self.message, location),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Run `future`, converting a panic during any poll into a [`Fault`].
pub async fn catch_fault<F: Future>(future: F) -> Result<F::Output, Fault> {
    let mut future = std::pin::pin!(future);
    let guarded = futures::future::poll_fn(move |cx| {
        clear_panic_site();
        future.as_mut().poll(cx)
    });

    AssertUnwindSafe(guarded)
        .catch_unwind()
        .await
        .map_err(Fault::from_panic)
}

/// Request details kept aside for reporting, since the request itself is
/// consumed by the inner service.
#[derive(Debug, Clone)]
struct RequestSummary {
    method: String,
    path: String,
    request_id: Option<String>,
}

impl RequestSummary {
    fn of<B>(req: &Request<B>) -> Self {
        Self {
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            request_id: req
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned),
        }
    }
}

/// Logs faults and dispatches alerts.
struct FaultReporter {
    sink: Arc<dyn AlertSink>,
    tracker: TaskTracker,
}

impl FaultReporter {
    fn report(&self, fault: &Fault, request: RequestSummary, after_deadline: bool) {
        error!(
            fault = %fault.message,
            location = ?fault.location,
            method = %request.method,
            path = %request.path,
            request_id = ?request.request_id,
            after_deadline,
            backtrace = %fault.backtrace,
            "Recovered from unhandled fault"
        );
        metrics::record_fault_recovered();

        let alert = Alert::new(fault.message.clone(), request.path, request.request_id);
        self.tracker.spawn(dispatch_alert(Arc::clone(&self.sink), alert));
    }

    fn recover(&self, fault: Fault, request: RequestSummary) -> Response<Body> {
        self.report(&fault, request, false);
        AppError::UnhandledFault(fault.to_string()).into_response()
    }
}

/// Reports faults that surface after the request was already answered.
///
/// Inserted into request extensions by [`RecoveryLayer`]; the timeout layer
/// uses it for handlers that fail after their deadline.
#[derive(Clone)]
pub(crate) struct LateFaultReporter {
    reporter: Arc<FaultReporter>,
    request: RequestSummary,
}

impl LateFaultReporter {
    pub(crate) fn report(&self, fault: &Fault) {
        self.reporter.report(fault, self.request.clone(), true);
    }
}

/// Deliver one alert; never panics and never returns an error.
async fn dispatch_alert(sink: Arc<dyn AlertSink>, alert: Alert) {
    match catch_fault(sink.send(&alert)).await {
        Ok(Ok(())) => debug!(subject = %alert.subject, "Fault alert dispatched"),
        Ok(Err(e)) => {
            error!(
                severity = "critical",
                error = %e,
                subject = %alert.subject,
                "Failed to dispatch fault alert"
            );
            metrics::record_alert_failure();
        }
        Err(fault) => {
            error!(
                severity = "critical",
                fault = %fault,
                subject = %alert.subject,
                "Alert sink panicked while dispatching fault alert"
            );
            metrics::record_alert_failure();
        }
    }
}

/// Recovery layer for the Tower middleware stack. Apply it outermost.
///
/// # Example
///
/// ```rust,ignore
/// let layer = RecoveryLayer::new(Arc::new(LogAlertSink), TaskTracker::new());
/// let app = Router::new().route("/", get(handler)).layer(layer);
/// ```
#[derive(Clone)]
pub struct RecoveryLayer {
    reporter: Arc<FaultReporter>,
}

impl RecoveryLayer {
    /// Create a recovery layer.
    ///
    /// Alert deliveries are spawned on `tracker` so shutdown can wait for
    /// them. Installs the panic hook on first use.
    pub fn new(sink: Arc<dyn AlertSink>, tracker: TaskTracker) -> Self {
        install_panic_hook();
        Self {
            reporter: Arc::new(FaultReporter { sink, tracker }),
        }
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoveryService {
            inner,
            reporter: Arc::clone(&self.reporter),
        }
    }
}

/// Recovery service wrapper.
#[derive(Clone)]
pub struct RecoveryService<S> {
    inner: S,
    reporter: Arc<FaultReporter>,
}

impl<S> Service<Request<Body>> for RecoveryService<S>
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
        let summary = RequestSummary::of(&req);
        let reporter = Arc::clone(&self.reporter);
        req.extensions_mut().insert(LateFaultReporter {
            reporter: Arc::clone(&reporter),
            request: summary.clone(),
        });

        // Inner layers may panic before returning their future
        clear_panic_site();
        let call = std::panic::catch_unwind(AssertUnwindSafe(|| self.inner.call(req)));

        Box::pin(async move {
            let outcome = match call {
                Ok(future) => catch_fault(future).await,
                Err(payload) => Err(Fault::from_panic(payload)),
            };

            match outcome {
                Ok(result) => result,
                Err(fault) => Ok(reporter.recover(fault, summary)),
            }
        })
    }
}
