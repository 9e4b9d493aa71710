//! Token-bucket rate limiting primitives.
//!
//! - [`TokenBucket`] - one key's quota with lazy refill
//! - [`BucketRule`] - static route-prefix quota configuration
//! - [`BucketRegistry`] - shared key → bucket map with lazy creation
//!
//! The HTTP side lives in `crate::middleware::rate_limit`.

pub mod bucket;
pub mod registry;
pub mod rule;

use thiserror::Error;

pub use bucket::TokenBucket;
pub use registry::BucketRegistry;
pub use rule::{BucketRule, RuleScope, match_rule, parse_rules};

/// Invalid bucket or rule configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BucketError {
    #[error("bucket capacity must be greater than 0")]
    ZeroCapacity,

    #[error("fill rate must be a positive finite number, got {0}")]
    InvalidFillRate(f64),

    #[error("quantum must be between 1 and capacity ({capacity}), got {quantum}")]
    InvalidQuantum { quantum: u64, capacity: u64 },

    #[error("key pattern must start with '/', got {0:?}")]
    InvalidPattern(String),

    #[error("invalid rule {0:?}, expected PATTERN=CAPACITY:FILL_RATE[:QUANTUM[:route|client]]")]
    InvalidSyntax(String),
}
