//! Admission engine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, trace};

use super::bucket::TokenBucket;
use super::decision::{Decision, LimitReachedHook, RateLimitHeaders, Rejection};
use super::keys::{build_keys, KeyTuple, KEY_SEPARATOR};
use super::request::RequestAttributes;
use super::rules::RuleSet;
use super::store::{ExpiringStore, SweeperHandle};
use crate::error::Result;

/// The rate limiter that decides whether a request is admitted.
///
/// This struct is thread-safe and can be shared across request handlers.
/// Admission is synchronous and never performs I/O; the only state it
/// mutates is the token buckets of the request's keys.
pub struct RateLimiter {
    /// Current rule set, replaced as a whole on reconfiguration
    rules: RwLock<Arc<RuleSet>>,
    /// Token buckets indexed by store key
    store: Arc<ExpiringStore>,
    /// Called once per rejected request
    on_limit_reached: RwLock<Option<LimitReachedHook>>,
}

impl RateLimiter {
    /// Create a rate limiter for the given rule set.
    pub fn new(rules: RuleSet) -> Self {
        let store = Arc::new(ExpiringStore::new(rules.entry_ttl()));
        Self {
            rules: RwLock::new(Arc::new(rules)),
            store,
            on_limit_reached: RwLock::new(None),
        }
    }

    /// Register the callback fired for every rejected request.
    pub fn with_limit_reached_hook<F>(self, hook: F) -> Self
    where
        F: Fn(&Rejection) + Send + Sync + 'static,
    {
        self.set_limit_reached_hook(hook);
        self
    }

    /// Replace the callback fired for every rejected request.
    pub fn set_limit_reached_hook<F>(&self, hook: F)
    where
        F: Fn(&Rejection) + Send + Sync + 'static,
    {
        *self.on_limit_reached.write() = Some(Arc::new(hook));
    }

    /// Remove the rejection callback.
    pub fn clear_limit_reached_hook(&self) {
        *self.on_limit_reached.write() = None;
    }

    /// The current rule set.
    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.read().clone()
    }

    /// Swap in a new rule set.
    ///
    /// Checks already in flight finish with the rule set they started with.
    /// When the rate or burst changes the existing buckets are dropped, since
    /// they were built for the old limits.
    pub fn set_rules(&self, rules: RuleSet) {
        let mut current = self.rules.write();
        let limits_changed = current.rate_per_second() != rules.rate_per_second()
            || current.burst() != rules.burst();

        info!(
            rate = rules.rate_per_second(),
            burst = rules.burst(),
            limits_changed = limits_changed,
            "Rule set updated"
        );

        *current = Arc::new(rules);
        drop(current);

        if limits_changed {
            self.store.clear();
        }
    }

    /// The underlying bucket store.
    pub fn store(&self) -> &Arc<ExpiringStore> {
        &self.store
    }

    /// Start evicting idle buckets every `sweep_interval` of the current rule
    /// set. Must be called from within a Tokio runtime.
    pub fn start_sweeper(&self) -> Result<SweeperHandle> {
        let interval = self.rules().sweep_interval();
        self.store.spawn_sweeper(interval)
    }

    /// Decide whether `request` is admitted at `now`.
    ///
    /// Every key built for the request must have a token. Checking stops at
    /// the first exhausted key, so later keys keep their tokens.
    pub fn admit<R>(&self, request: &R, now: Instant) -> Decision
    where
        R: RequestAttributes + ?Sized,
    {
        let rules = self.rules();
        let keys = build_keys(&rules, request);

        if keys.is_empty() {
            trace!(path = %request.path(), "No applicable rule, request passes");
            return Decision::Skipped;
        }

        self.check_keys(
            &rules,
            keys.iter().map(KeyTuple::to_string_key),
            rules.entry_ttl(),
            now,
        )
    }

    /// Whether `request` must be rejected at `now`.
    pub fn is_limited<R>(&self, request: &R, now: Instant) -> bool
    where
        R: RequestAttributes + ?Sized,
    {
        self.admit(request, now).is_limited()
    }

    /// Check one explicit key tuple, bypassing key derivation.
    pub fn limit_by_keys<S>(&self, parts: &[S], now: Instant) -> Decision
    where
        S: AsRef<str>,
    {
        let key = parts
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<&str>>()
            .join(KEY_SEPARATOR);
        let rules = self.rules();
        self.check_keys(&rules, std::iter::once(key), rules.entry_ttl(), now)
    }

    /// Whether the bucket for `key` is exhausted, giving the bucket its own
    /// idle lifetime instead of the rule set's.
    pub fn limit_reached_with_ttl(&self, key: &str, ttl: Duration, now: Instant) -> bool {
        let rules = self.rules();
        self.check_keys(&rules, std::iter::once(key.to_string()), ttl, now)
            .is_limited()
    }

    fn check_keys<I>(&self, rules: &RuleSet, keys: I, ttl: Duration, now: Instant) -> Decision
    where
        I: IntoIterator<Item = String>,
    {
        let mut remaining = u32::MAX;
        let mut reset = Duration::ZERO;

        for key in keys {
            let cell = self.store.get_or_create_with_ttl(&key, ttl, now, || {
                TokenBucket::new(rules.rate_per_second(), rules.burst(), now)
            });

            let (admitted, tokens, until_token) = {
                let mut bucket = cell.lock();
                // A check that loaded other rules may have created this bucket
                if bucket.rate() != rules.rate_per_second() || bucket.capacity() != rules.burst() {
                    debug!(key = %key, "Rebuilding token bucket for current limits");
                    *bucket = TokenBucket::new(rules.rate_per_second(), rules.burst(), now);
                }
                let admitted = bucket.try_consume(now);
                (admitted, bucket.tokens(now), bucket.time_until_token(now))
            };

            remaining = remaining.min(tokens.floor() as u32);
            reset = reset.max(until_token);

            trace!(key = %key, admitted = admitted, tokens = tokens, "Checked token bucket");

            if !admitted {
                debug!(key = %key, "Rate limit exceeded");
                let headers = RateLimitHeaders::new(rules, remaining, reset);
                let rejection = Rejection::new(rules, key, headers);
                self.notify_limit_reached(&rejection);
                return Decision::Limited(rejection);
            }
        }

        Decision::Allowed {
            headers: RateLimitHeaders::new(rules, remaining, reset),
        }
    }

    fn notify_limit_reached(&self, rejection: &Rejection) {
        // Run the hook without holding the lock
        let hook = self.on_limit_reached.read().clone();
        if let Some(hook) = hook {
            hook(rejection);
        }
    }
}
