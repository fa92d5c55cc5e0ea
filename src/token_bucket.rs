//! Token bucket quota primitive.
//!
//! A bucket starts full and refills continuously at `refill_per_sec`, clamped to
//! `capacity`. Each consumption attempt first refills for the elapsed time and
//! then either takes `cost` tokens or leaves the level untouched.
//!
//! The refill-then-decrement sequence runs under a per-bucket mutex so concurrent
//! callers can never admit more work than the bucket holds. Time is passed in by
//! the caller, which keeps the arithmetic deterministic and testable.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::policy::BucketLimits;

/// Outcome of one [`TokenBucket::try_consume`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Consumption {
    /// Whether `cost` tokens were taken.
    pub allowed: bool,
    /// Level after the call (post-decrement when allowed).
    pub remaining: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill_millis: u64,
}

/// One quota counter.
#[derive(Debug)]
pub struct TokenBucket {
    limits: BucketLimits,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A full bucket whose refill clock starts at `now_millis`.
    pub fn new(limits: BucketLimits, now_millis: u64) -> Self {
        Self {
            limits,
            state: Mutex::new(BucketState {
                tokens: f64::from(limits.capacity()),
                last_refill_millis: now_millis,
            }),
        }
    }

    /// Refill for the time elapsed up to `now_millis`, then try to take `cost` tokens.
    ///
    /// A `now_millis` older than the last refill counts as no elapsed time; the
    /// refill timestamp never moves backwards.
    pub fn try_consume(&self, cost: u32, now_millis: u64) -> Consumption {
        let mut state = self.lock();
        let elapsed_secs = now_millis.saturating_sub(state.last_refill_millis) as f64 / 1_000.0;
        let capacity = f64::from(self.limits.capacity());
        state.tokens = (state.tokens + elapsed_secs * self.limits.refill_per_sec()).min(capacity);
        state.last_refill_millis = state.last_refill_millis.max(now_millis);

        let cost = f64::from(cost);
        if state.tokens >= cost {
            state.tokens -= cost;
            Consumption { allowed: true, remaining: state.tokens }
        } else {
            Consumption { allowed: false, remaining: state.tokens }
        }
    }

    /// Current level without applying a refill.
    pub fn tokens(&self) -> f64 {
        self.lock().tokens
    }

    /// Limits this bucket was created with.
    pub fn limits(&self) -> BucketLimits {
        self.limits
    }

    /// Maximum tokens.
    pub fn capacity(&self) -> u32 {
        self.limits.capacity()
    }

    /// Tokens added per second.
    pub fn refill_per_sec(&self) -> f64 {
        self.limits.refill_per_sec()
    }

    // Nothing panics while the guard is held, so a poisoned lock still holds a
    // consistent state.
    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
