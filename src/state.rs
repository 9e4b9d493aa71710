//! Shared application state for Axum handlers and middleware.
//!
//! - **Registry**: token buckets shared by the rate limit layer and the sweeper
//! - **Codec**: token issuance and validation
//! - **Credentials**: application key / secret store for `POST /auth`
//! - **Alert sink**: destination for fault alerts
//! - **Configuration**: runtime configuration access
//!
//! # Structured Concurrency
//!
//! Background tasks (the idle bucket sweeper and fault alert deliveries) are
//! managed using `tokio_util::task::TaskTracker` and `CancellationToken`.
//! Call `shutdown()` to stop them before application exit.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::alert::{AlertSink, LogAlertSink, WebhookAlertSink};
use crate::auth::{CredentialStore, StaticCredentials, TokenCodec};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::limiter::BucketRegistry;
use crate::metrics;

/// Shared application state.
///
/// Cloned for each request handler; all internal data is behind `Arc`.
///
/// # Lifecycle
///
/// The bucket sweeper is spawned when the state is created, so construction
/// must happen inside a Tokio runtime. Call `shutdown()` before dropping:
///
/// ```rust,ignore
/// let state = AppState::new(config)?;
/// // ... serve ...
/// state.shutdown().await;  // Wait for background tasks to complete
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Token buckets keyed by resolved rate-limit key
    pub registry: BucketRegistry,
    /// Token issuance and validation
    pub codec: Arc<TokenCodec>,
    /// Credentials accepted by `POST /auth`
    pub credentials: Arc<dyn CredentialStore>,
    /// Receives fault alerts from the recovery layer
    pub alert_sink: Arc<dyn AlertSink>,
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Tracks spawned background tasks for graceful shutdown
    task_tracker: TaskTracker,
    /// Cancellation token for signaling background tasks to stop
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Create application state from configuration.
    ///
    /// Uses a webhook alert sink when `ALERT_WEBHOOK_URL` is set, otherwise
    /// alerts are only logged.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the signing key is unusable or the
    /// webhook client cannot be built.
    pub fn new(config: Config) -> AppResult<Self> {
        let alert_sink: Arc<dyn AlertSink> = match &config.alert_webhook_url {
            Some(url) => {
                info!(url = %url, "Fault alerts will be sent to webhook");
                Arc::new(
                    WebhookAlertSink::new(url.clone(), config.alert_timeout)
                        .map_err(|e| AppError::ConfigError(e.to_string()))?,
                )
            }
            None => Arc::new(LogAlertSink),
        };
        Self::with_alert_sink(config, alert_sink)
    }

    /// Create application state with an explicit alert sink.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the signing key is unusable.
    pub fn with_alert_sink(config: Config, alert_sink: Arc<dyn AlertSink>) -> AppResult<Self> {
        let codec = TokenCodec::new(
            config.jwt_secret.as_bytes(),
            config.jwt_issuer.clone(),
            config.jwt_expiry,
        )?;

        let credentials = StaticCredentials::new(config.auth_clients.iter().cloned());
        if credentials.is_empty() {
            warn!("AUTH_CLIENTS is empty; POST /auth will reject every request");
        }

        let state = Self {
            config: Arc::new(config),
            registry: BucketRegistry::new(),
            codec: Arc::new(codec),
            credentials: Arc::new(credentials),
            alert_sink,
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        if state.config.rate_limiting_enabled() && state.config.bucket_sweep_enabled() {
            state.spawn_bucket_sweeper();
        }

        Ok(state)
    }

    /// Tracker for background work tied to this state's lifetime.
    pub fn task_tracker(&self) -> &TaskTracker {
        &self.task_tracker
    }

    /// Spawn the background idle-bucket sweeper.
    ///
    /// Clones only the registry so the task does not keep the whole state
    /// alive.
    fn spawn_bucket_sweeper(&self) {
        let registry = self.registry.clone();
        let idle_ttl = self.config.bucket_idle_ttl;
        let period = self.config.bucket_sweep_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased; // Check cancellation first

                    _ = cancel.cancelled() => {
                        debug!("Bucket sweeper received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = registry.evict_idle(idle_ttl);
                        let remaining = registry.len();
                        metrics::set_bucket_count(remaining);
                        if evicted > 0 {
                            debug!(evicted, remaining, "Evicted idle rate limit buckets");
                        }
                    }
                }
            }

            debug!("Bucket sweeper shutting down");
        });
    }

    /// Gracefully shutdown all background tasks.
    ///
    /// 1. Signals the sweeper to stop via the cancellation token
    /// 2. Closes the task tracker
    /// 3. Waits for the sweeper and any in-flight alert deliveries
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> Config {
        Config {
            auth_clients: vec![("blog".into(), "s3cret".into())],
            bucket_idle_ttl: Duration::from_secs(5),
            bucket_sweep_interval: Duration::from_secs(1),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_new_uses_config() {
        let state = AppState::new(config()).unwrap();
        assert!(state.credentials.verify("blog", "s3cret"));
        assert_eq!(state.codec.issuer(), "admission-guard");
        assert!(state.registry.is_empty());
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_new_rejects_short_secret() {
        let result = AppState::new(Config {
            jwt_secret: "short".into(),
            ..Config::default()
        });
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_idle_buckets() {
        let state = AppState::new(config()).unwrap();
        let rule = state.config.rate_limit_rules[1].clone();
        state.registry.try_consume("/api", &rule);
        assert_eq!(state.registry.len(), 1);

        // Idle TTL is 5s and the bucket refills in well under that
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(state.registry.is_empty());

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_completes() {
        let state = AppState::new(config()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), state.shutdown())
            .await
            .expect("shutdown should not hang");
    }
}
