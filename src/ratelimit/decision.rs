//! Admission decisions and the response metadata handed to the transport
//! adapter.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::rules::RuleSet;

/// Callback invoked exactly once per rejected request.
pub type LimitReachedHook = Arc<dyn Fn(&Rejection) + Send + Sync>;

/// Informational headers for client backoff.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitHeaders {
    /// Configured burst (`RateLimit-Limit`)
    pub limit: u32,
    /// Whole requests left on the tightest key (`RateLimit-Remaining`)
    pub remaining: u32,
    /// Seconds until another request is admitted, rounded up (`RateLimit-Reset`)
    pub reset_secs: u64,
    /// Sustained rate per second (`X-Rate-Limit-Limit`)
    pub rate_per_second: f64,
}

impl RateLimitHeaders {
    /// Build headers from the configured limits and the observed state.
    pub fn new(rules: &RuleSet, remaining: u32, reset: Duration) -> Self {
        Self {
            limit: rules.burst(),
            remaining,
            reset_secs: ceil_secs(reset),
            rate_per_second: rules.rate_per_second(),
        }
    }

    /// Header name/value pairs, ready to be written on the response.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("RateLimit-Limit", self.limit.to_string()),
            ("RateLimit-Remaining", self.remaining.to_string()),
            ("RateLimit-Reset", self.reset_secs.to_string()),
            ("X-Rate-Limit-Limit", format!("{:.2}", self.rate_per_second)),
            // The rate is always expressed per one second
            ("X-Rate-Limit-Duration", "1".to_string()),
        ]
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

/// Everything the transport adapter needs to answer a rejected request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    /// HTTP status code
    pub status_code: u16,
    /// Response body
    pub message: String,
    /// Content type of the body
    pub content_type: String,
    /// The store key that ran out of tokens
    pub key: String,
    /// Backoff headers
    pub headers: RateLimitHeaders,
}

impl Rejection {
    /// Build a rejection using the rule set's response settings.
    pub fn new(rules: &RuleSet, key: impl Into<String>, headers: RateLimitHeaders) -> Self {
        Self {
            status_code: rules.status_code(),
            message: rules.message().to_string(),
            content_type: rules.content_type().to_string(),
            key: key.into(),
            headers,
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// The rule set does not apply to this request; pass it through.
    Skipped,
    /// Every key had a token; proceed to the handler.
    Allowed {
        /// Backoff headers
        headers: RateLimitHeaders,
    },
    /// A key ran out of tokens; answer with the rejection.
    Limited(Rejection),
}

impl Decision {
    /// Whether the request must be rejected.
    pub fn is_limited(&self) -> bool {
        matches!(self, Decision::Limited(_))
    }

    /// Backoff headers, if the rule set applied to the request.
    pub fn headers(&self) -> Option<&RateLimitHeaders> {
        match self {
            Decision::Skipped => None,
            Decision::Allowed { headers } => Some(headers),
            Decision::Limited(rejection) => Some(&rejection.headers),
        }
    }

    /// The rejection, if the request was limited.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Decision::Limited(rejection) => Some(rejection),
            _ => None,
        }
    }
}
