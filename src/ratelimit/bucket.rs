//! Token bucket implementation.

use std::time::{Duration, Instant};

/// A token bucket bound to a single composite key.
///
/// The bucket starts full and refills continuously at `rate` tokens per
/// second up to `capacity`. Each admitted request consumes one token.
///
/// The bucket itself is not synchronized; the store wraps every bucket in
/// its own mutex so that checks on different keys never contend.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Tokens currently available (fractional refill is kept)
    tokens: f64,
    /// Maximum number of tokens (the burst size)
    capacity: f64,
    /// Refill rate in tokens per second
    rate: f64,
    /// When tokens were last added
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// `rate` and `capacity` are validated by the rule set before a bucket is
    /// ever built from them.
    pub fn new(rate: f64, capacity: u32, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        Self {
            tokens: capacity,
            capacity,
            rate,
            last_refill: now,
        }
    }

    /// Refill for the time elapsed since the last check, then try to take one
    /// token.
    ///
    /// Returns `true` if the request is admitted. A rejected call leaves the
    /// token count untouched.
    pub fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens that would be available at `now`, without mutating the bucket.
    pub fn tokens(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill);
        (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity)
    }

    /// Time until at least one whole token is available.
    pub fn time_until_token(&self, now: Instant) -> Duration {
        let missing = 1.0 - self.tokens(now);
        if missing <= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(missing / self.rate).unwrap_or(Duration::MAX)
        }
    }

    /// Maximum number of tokens.
    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    /// Refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn refill(&mut self, now: Instant) {
        // An out-of-order instant (a caller that sampled the clock before a
        // concurrent caller) adds nothing and must not move the clock back.
        if now <= self.last_refill {
            return;
        }

        let elapsed = now - self.last_refill;
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}
