//! Expiring key-value store for token buckets.
//!
//! Entries carry a sliding deadline that moves forward on every access.
//! Expiry is checked lazily on each lookup and eagerly by a periodic sweep,
//! so an entry past its deadline is never handed out even if the sweep has
//! not removed it yet.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::bucket::TokenBucket;
use crate::error::{Result, TollgateError};

/// A shared, individually locked token bucket.
pub type SharedBucket = Arc<Mutex<TokenBucket>>;

struct StoreEntry {
    bucket: SharedBucket,
    ttl: Duration,
    /// `None` when `now + ttl` does not fit in an `Instant`
    expires_at: Option<Instant>,
}

impl StoreEntry {
    fn new(bucket: TokenBucket, ttl: Duration, now: Instant) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(bucket)),
            ttl,
            expires_at: now.checked_add(ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }

    fn touch(&mut self, ttl: Duration, now: Instant) {
        self.ttl = ttl;
        self.expires_at = now.checked_add(ttl);
    }
}

/// Concurrent map from composite key to token bucket with sliding TTL.
///
/// The map is sharded ([`DashMap`]); inserts and evictions lock a single
/// shard, and token mutation locks a single bucket after the shard lock has
/// been released.
pub struct ExpiringStore {
    entries: DashMap<String, StoreEntry>,
    default_ttl: Duration,
}

impl ExpiringStore {
    /// Create an empty store whose entries live for `default_ttl` after their
    /// last access.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    /// The store-wide TTL.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Return the live bucket for `key`, creating it with `factory` when the
    /// key is absent or its entry has expired.
    pub fn get_or_create<F>(&self, key: &str, now: Instant, factory: F) -> SharedBucket
    where
        F: FnOnce() -> TokenBucket,
    {
        self.get_or_create_with_ttl(key, self.default_ttl, now, factory)
    }

    /// Same as [`get_or_create`](Self::get_or_create) with a TTL for this
    /// entry only.
    ///
    /// Creation happens under the shard lock, so concurrent callers for the
    /// same key always end up sharing one bucket.
    pub fn get_or_create_with_ttl<F>(
        &self,
        key: &str,
        ttl: Duration,
        now: Instant,
        factory: F,
    ) -> SharedBucket
    where
        F: FnOnce() -> TokenBucket,
    {
        // Fast path: no key allocation for a live entry
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired(now) {
                entry.touch(ttl, now);
                return entry.bucket.clone();
            }
        }

        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    debug!(key = %key, "Replacing expired token bucket");
                    *entry = StoreEntry::new(factory(), ttl, now);
                } else {
                    entry.touch(ttl, now);
                }
                entry.bucket.clone()
            }
            MapEntry::Vacant(vacant) => {
                debug!(key = %key, ttl = ?ttl, "Creating new token bucket");
                vacant.insert(StoreEntry::new(factory(), ttl, now)).bucket.clone()
            }
        }
    }

    /// Look up `key` without creating it.
    ///
    /// A hit refreshes the entry's deadline. An expired entry is removed and
    /// reported as absent.
    pub fn get(&self, key: &str, now: Instant) -> Option<SharedBucket> {
        {
            let mut entry = self.entries.get_mut(key)?;
            if !entry.is_expired(now) {
                let ttl = entry.ttl;
                entry.touch(ttl, now);
                return Some(entry.bucket.clone());
            }
        }

        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    /// Remove every entry whose deadline has passed.
    ///
    /// Shards are visited one at a time; no lock is held across the whole
    /// scan. Returns the number of removed entries.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Start a background task that sweeps the store every `interval`.
    ///
    /// The task holds a weak reference and ends on its own once the store is
    /// dropped. Must be called from within a Tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> Result<SweeperHandle> {
        if interval.is_zero() {
            return Err(TollgateError::Config(
                "sweep interval must be greater than zero".to_string(),
            ));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            TollgateError::Config(format!("sweeper requires a Tokio runtime: {}", e))
        })?;

        let store: Weak<Self> = Arc::downgrade(self);

        info!(interval = ?interval, "Starting token bucket sweeper");

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(store) = store.upgrade() else {
                    debug!("Store dropped, stopping sweeper");
                    break;
                };

                let removed = store.sweep(Instant::now());
                if removed > 0 {
                    debug!(
                        removed = removed,
                        remaining = store.len(),
                        "Swept expired token buckets"
                    );
                }
            }
        });

        Ok(SweeperHandle { handle })
    }

    /// Number of entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// Handle to a running sweeper task. Dropping it stops the task.
#[derive(Debug)]
pub struct SweeperHandle {
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper.
    pub fn stop(self) {
        info!("Stopping token bucket sweeper");
        // Drop aborts the task
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
