//! Rate limiting logic and state management.

mod backend;
mod bucket;
mod decision;
mod keys;
mod limiter;
mod request;
mod rules;
mod store;

pub use backend::{CounterBackedLimiter, CounterStore, MemoryCounterStore};
pub use bucket::TokenBucket;
pub use decision::{Decision, LimitReachedHook, RateLimitHeaders, Rejection};
pub use keys::{build_keys, canonicalize_ip, resolve_client_ip, KeyTuple, KEY_SEPARATOR};
pub use limiter::RateLimiter;
pub use request::{ContextLookup, RequestAttributes, RequestInfo};
pub use rules::{
    IpLookup, RuleSet, RuleSetBuilder, DEFAULT_CONTENT_TYPE, DEFAULT_ENTRY_TTL, DEFAULT_MESSAGE,
    DEFAULT_SWEEP_INTERVAL, DEFAULT_STATUS_CODE,
};
pub use store::{ExpiringStore, SharedBucket, SweeperHandle};
