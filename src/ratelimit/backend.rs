//! Pluggable counter backends.
//!
//! [`CounterStore`] abstracts over where counters live, so several processes
//! can share limits through an external store. [`CounterBackedLimiter`]
//! applies a fixed-window approximation of the token bucket on top of it:
//! `burst` requests per window of `burst / rate` seconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use super::decision::{Decision, LimitReachedHook, RateLimitHeaders, Rejection};
use super::keys::build_keys;
use super::request::RequestAttributes;
use super::rules::RuleSet;
use crate::error::Result;

/// Trait for counter storage implementations.
///
/// Implementations must make `increment_and_get` atomic per key: two
/// concurrent increments of the same key must observe different counts.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `amount` to the counter for `key` and return the new count.
    ///
    /// A counter that does not exist, or whose window has ended, starts from
    /// zero with a window of `ttl`.
    async fn increment_and_get(&self, key: &str, amount: u64, ttl: Duration) -> Result<u64>;

    /// Current count for `key`, or `None` if there is no live counter.
    async fn get(&self, key: &str) -> Result<Option<u64>>;
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: u64,
    /// `None` when the window outlasts any representable `Instant`
    window_end: Option<Instant>,
}

impl WindowCounter {
    fn has_ended(&self, now: Instant) -> bool {
        matches!(self.window_end, Some(end) if end <= now)
    }
}

/// In-process [`CounterStore`] with fixed windows.
///
/// A window opens on the first increment and lasts for the ttl given then.
/// Ended windows are reset on the next increment, dropped on lookup, and
/// removed in bulk by [`sweep`](Self::sweep).
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, WindowCounter>,
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of counters held, including ended windows not yet removed.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether the store holds no counters.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Remove every counter whose window has ended. Returns the number of
    /// removed counters.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.counters.retain(|_, counter| {
            let keep = !counter.has_ended(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            debug!(removed = removed, remaining = self.counters.len(), "Swept ended counters");
        }
        removed
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_and_get(&self, key: &str, amount: u64, ttl: Duration) -> Result<u64> {
        let now = Instant::now();
        let window_end = now.checked_add(ttl);

        let count = match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let counter = entry.get_mut();
                if counter.has_ended(now) {
                    trace!(key = %key, "Counter window ended, starting a new one");
                    *counter = WindowCounter {
                        count: amount,
                        window_end,
                    };
                } else {
                    counter.count = counter.count.saturating_add(amount);
                }
                counter.count
            }
            Entry::Vacant(entry) => {
                debug!(key = %key, "Creating new window counter");
                entry.insert(WindowCounter {
                    count: amount,
                    window_end,
                });
                amount
            }
        };

        Ok(count)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let now = Instant::now();
        if let Some(counter) = self.counters.get(key) {
            if !counter.has_ended(now) {
                return Ok(Some(counter.count));
            }
        }

        self.counters.remove_if(key, |_, counter| counter.has_ended(now));
        Ok(None)
    }
}

/// Admission over a [`CounterStore`].
///
/// Store failures never reject a request: the request is admitted, a warning
/// is logged and [`backend_errors`](Self::backend_errors) is incremented.
pub struct CounterBackedLimiter<S> {
    store: Arc<S>,
    rules: RwLock<Arc<RuleSet>>,
    on_limit_reached: RwLock<Option<LimitReachedHook>>,
    backend_errors: AtomicU64,
}

impl<S: CounterStore> CounterBackedLimiter<S> {
    /// Create a limiter over `store`.
    pub fn new(store: Arc<S>, rules: RuleSet) -> Self {
        Self {
            store,
            rules: RwLock::new(Arc::new(rules)),
            on_limit_reached: RwLock::new(None),
            backend_errors: AtomicU64::new(0),
        }
    }

    /// Register the callback fired for every rejected request.
    pub fn with_limit_reached_hook<F>(self, hook: F) -> Self
    where
        F: Fn(&Rejection) + Send + Sync + 'static,
    {
        *self.on_limit_reached.write() = Some(Arc::new(hook));
        self
    }

    /// The current rule set.
    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.read().clone()
    }

    /// Swap in a new rule set.
    pub fn set_rules(&self, rules: RuleSet) {
        *self.rules.write() = Arc::new(rules);
    }

    /// The underlying counter store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Number of store failures that were admitted without a decision.
    pub fn backend_errors(&self) -> u64 {
        self.backend_errors.load(Ordering::Relaxed)
    }

    /// Decide whether `request` is admitted.
    pub async fn admit<R>(&self, request: &R) -> Decision
    where
        R: RequestAttributes + Sync + ?Sized,
    {
        let rules = self.rules();
        let keys = build_keys(&rules, request);

        if keys.is_empty() {
            return Decision::Skipped;
        }

        let limit = u64::from(rules.burst());
        let window = window_for(&rules);
        let mut remaining = limit;

        for key in keys {
            let key = key.to_string_key();

            let count = match self.store.increment_and_get(&key, 1, window).await {
                Ok(count) => count,
                Err(e) => {
                    self.backend_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "Counter store failed, admitting request");
                    return Decision::Allowed {
                        headers: RateLimitHeaders::new(&rules, rules.burst(), Duration::ZERO),
                    };
                }
            };

            trace!(key = %key, count = count, limit = limit, "Checked window counter");
            remaining = remaining.min(limit.saturating_sub(count));

            if count > limit {
                debug!(key = %key, count = count, limit = limit, "Rate limit exceeded");
                let headers = RateLimitHeaders::new(&rules, 0, window);
                let rejection = Rejection::new(&rules, key, headers);
                let hook = self.on_limit_reached.read().clone();
                if let Some(hook) = hook {
                    hook(&rejection);
                }
                return Decision::Limited(rejection);
            }
        }

        Decision::Allowed {
            headers: RateLimitHeaders::new(&rules, remaining as u32, window),
        }
    }
}

/// Length of the window that admits `burst` requests at `rate` per second.
fn window_for(rules: &RuleSet) -> Duration {
    Duration::try_from_secs_f64(f64::from(rules.burst()) / rules.rate_per_second())
        .unwrap_or(Duration::MAX)
}
