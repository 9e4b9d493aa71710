//! Single-key token bucket with lazy refill.
//!
//! # Algorithm
//!
//! A bucket holds up to `capacity` tokens and gains `fill_rate` tokens per
//! second. There is no background timer: every call to [`TokenBucket::try_consume`]
//! first credits the tokens accrued since the previous call, caps the result at
//! `capacity`, then tries to take the requested amount.
//!
//! ```text
//! available = min(capacity, available + elapsed_secs * fill_rate)
//! ```
//!
//! # Time Source
//!
//! Elapsed time is measured with `tokio::time::Instant`, which is monotonic
//! (wall-clock adjustments cannot mint or destroy tokens) and follows tokio's
//! paused clock in tests.
//!
//! # Thread Safety
//!
//! The mutable state sits behind a per-bucket mutex, so concurrent calls on
//! the same bucket are serialized while unrelated buckets never contend.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::BucketError;

/// Mutable part of a bucket, only touched under the lock.
#[derive(Debug)]
struct BucketState {
    available: f64,
    last_refill: Instant,
}

/// Quota state for one rate-limit key.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    fill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// # Errors
    ///
    /// Returns `BucketError` if `capacity` is zero or `fill_rate` is not a
    /// positive finite number.
    pub fn new(capacity: u64, fill_rate: f64) -> Result<Self, BucketError> {
        validate(capacity, fill_rate)?;
        Ok(Self::new_unchecked(capacity, fill_rate))
    }

    /// Construct from values that were already validated by a `BucketRule`.
    pub(crate) fn new_unchecked(capacity: u64, fill_rate: f64) -> Self {
        Self {
            capacity,
            fill_rate,
            state: Mutex::new(BucketState {
                available: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Maximum number of tokens the bucket can hold.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn fill_rate(&self) -> f64 {
        self.fill_rate
    }

    /// Take `n` tokens if available.
    ///
    /// Returns the number of tokens granted: `n` on success, `0` when the
    /// bucket holds fewer than `n` tokens. Never blocks beyond the per-bucket
    /// lock. A request for zero tokens always succeeds and returns `0`.
    pub fn try_consume(&self, n: u64) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());

        let wanted = n as f64;
        if state.available >= wanted {
            state.available -= wanted;
            n
        } else {
            0
        }
    }

    /// Whole tokens currently available, after crediting elapsed time.
    pub fn available(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.available.floor() as u64
    }

    /// Time since the bucket was last touched.
    pub fn idle_for(&self) -> Duration {
        let state = self.state.lock();
        Instant::now().saturating_duration_since(state.last_refill)
    }

    /// Time an empty bucket needs to refill completely.
    ///
    /// Once a bucket has been idle this long it is indistinguishable from a
    /// freshly created one. Saturates at `Duration::MAX` for rates so slow
    /// the refill time is not representable.
    pub fn time_to_full(&self) -> Duration {
        Duration::try_from_secs_f64(self.capacity as f64 / self.fill_rate)
            .unwrap_or(Duration::MAX)
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let credited = state.available + elapsed.as_secs_f64() * self.fill_rate;
        state.available = credited.min(self.capacity as f64);
        state.last_refill = now;
    }
}

/// Shared validation for bucket parameters.
pub(crate) fn validate(capacity: u64, fill_rate: f64) -> Result<(), BucketError> {
    if capacity == 0 {
        return Err(BucketError::ZeroCapacity);
    }
    if !fill_rate.is_finite() || fill_rate <= 0.0 {
        return Err(BucketError::InvalidFillRate(fill_rate));
    }
    Ok(())
}
