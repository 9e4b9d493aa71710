//! # Admission Guard
//!
//! Request admission and resilience middleware for Axum services:
//!
//! - **Rate Limiting**: Per-key token buckets selected by route prefix rules
//! - **Authentication**: HS256 bearer tokens issued at `POST /auth`
//! - **Timeouts**: Per-request deadlines with cooperative cancellation
//! - **Recovery**: Panics become a generic 500 plus an operator alert
//! - **Observability**: Request IDs, structured logging, Prometheus metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Request ID → Trace → Recovery → Timeout → Rate Limit       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Bearer Auth (protected routes only)                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, auth, whoami)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  BucketRegistry · TokenCodec · AlertSink                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use admission_guard::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config)?;
//!     let app = build_router(state.clone());
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app).await?;
//!     state.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Guarding Your Own Routes
//!
//! ```rust,ignore
//! let app = admission_guard::routes::apply_guards(my_router, &state);
//! ```

pub mod alert;
pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use middleware::RequestContext;
pub use routes::{apply_guards, build_router};
pub use state::AppState;
