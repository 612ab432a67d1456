//! Offline replay of recorded requests.
//!
//! Input is JSON lines, one request per line:
//!
//! ```json
//! {"method": "POST", "path": "/login", "remote_addr": "10.0.0.1:4321",
//!  "headers": {"X-Auth-Token": ["secret1"]}, "at": "2024-05-01T12:00:00.250Z"}
//! ```
//!
//! Each record is run through a [`RateLimiter`] and one JSON decision is
//! written per line. Records carrying an `at` timestamp are placed on the
//! limiter's clock relative to the first timestamped record; records without
//! one are checked at the moment they are read.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, TollgateError};
use crate::ratelimit::{Decision, RateLimiter, RequestInfo};

/// One recorded request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReplayRecord {
    /// HTTP method
    #[serde(default = "default_method")]
    pub method: String,
    /// URL path
    #[serde(default = "default_path")]
    pub path: String,
    /// Peer address
    #[serde(default)]
    pub remote_addr: Option<String>,
    /// Header name to values
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    /// Basic-auth username
    #[serde(default)]
    pub basic_auth_user: Option<String>,
    /// Request-scoped context values
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// When the request arrived
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

impl From<ReplayRecord> for RequestInfo {
    fn from(record: ReplayRecord) -> Self {
        let mut request = RequestInfo::new(record.method, record.path);
        request.remote_addr = record.remote_addr;
        request.basic_auth_user = record.basic_auth_user;
        request.context = record.context;
        request.headers = record
            .headers
            .into_iter()
            .flat_map(|(name, values)| values.into_iter().map(move |v| (name.clone(), v)))
            .collect();
        request
    }
}

/// The decision for one input line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayOutcome {
    /// 1-based input line number
    pub line: usize,
    /// Admission decision
    pub decision: Decision,
}

/// Totals for a replay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    /// Requests admitted
    pub allowed: usize,
    /// Requests rejected as over-limit
    pub limited: usize,
    /// Requests no rule applied to
    pub skipped: usize,
}

/// Maps record timestamps onto the monotonic clock.
#[derive(Debug, Default)]
struct Timeline {
    origin: Option<(DateTime<Utc>, Instant)>,
}

impl Timeline {
    fn instant_for(&mut self, at: Option<DateTime<Utc>>) -> Instant {
        let Some(at) = at else {
            return Instant::now();
        };

        let (first_at, base) = *self.origin.get_or_insert_with(|| (at, Instant::now()));
        // Records earlier than the first one are clamped to it
        let offset = (at - first_at).to_std().unwrap_or_default();
        base + offset
    }
}

/// Run every record in `input` through `limiter`, writing one JSON outcome
/// per line to `output`.
pub fn replay<I, O>(limiter: &RateLimiter, input: I, mut output: O) -> Result<ReplaySummary>
where
    I: BufRead,
    O: Write,
{
    let mut timeline = Timeline::default();
    let mut summary = ReplaySummary::default();

    for (index, line) in input.lines().enumerate() {
        let line_number = index + 1;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let record: ReplayRecord = serde_json::from_str(&line).map_err(|source| {
            TollgateError::Record {
                line: line_number,
                source,
            }
        })?;

        let now = timeline.instant_for(record.at);
        let request = RequestInfo::from(record);
        let decision = limiter.admit(&request, now);

        match &decision {
            Decision::Skipped => summary.skipped += 1,
            Decision::Allowed { .. } => summary.allowed += 1,
            Decision::Limited(_) => summary.limited += 1,
        }
        debug!(line = line_number, limited = decision.is_limited(), "Replayed request");

        let outcome = ReplayOutcome {
            line: line_number,
            decision,
        };
        serde_json::to_writer(&mut output, &outcome)?;
        output.write_all(b"\n")?;
    }

    output.flush()?;
    info!(
        allowed = summary.allowed,
        limited = summary.limited,
        skipped = summary.skipped,
        "Replay finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RuleSet;
    use std::time::Duration;

    fn limiter(rate: f64, burst: u32) -> RateLimiter {
        RateLimiter::new(RuleSet::builder(rate, burst).build().unwrap())
    }

    fn run(limiter: &RateLimiter, input: &str) -> (ReplaySummary, Vec<serde_json::Value>) {
        let mut output = Vec::new();
        let summary = replay(limiter, input.as_bytes(), &mut output).unwrap();
        let lines = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        (summary, lines)
    }

    #[test]
    fn test_record_to_request() {
        let json = r#"{
            "path": "/a",
            "headers": {"X-Forwarded-For": ["1.1.1.1", "2.2.2.2"]},
            "context": {"tier": "gold"}
        }"#;
        let record: ReplayRecord = serde_json::from_str(json).unwrap();
        let request = RequestInfo::from(record);

        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/a");
        assert_eq!(request.headers.len(), 2);
        assert_eq!(request.context["tier"], "gold");
    }

    #[test]
    fn test_replay_burst() {
        let input = r#"{"remote_addr": "10.0.0.1:1000", "at": "2024-05-01T12:00:00Z"}
{"remote_addr": "10.0.0.1:1001", "at": "2024-05-01T12:00:00.100Z"}

{"remote_addr": "10.0.0.1:1002", "at": "2024-05-01T12:00:01.100Z"}
{"path": "/"}
"#;
        let (summary, lines) = run(&limiter(1.0, 1), input);

        assert_eq!(
            summary,
            ReplaySummary {
                allowed: 2,
                limited: 1,
                skipped: 1
            }
        );
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["decision"]["decision"], "allowed");
        assert_eq!(lines[1]["decision"]["decision"], "limited");
        assert_eq!(lines[1]["decision"]["status_code"], 429);
        assert_eq!(lines[2]["line"], 4);
        assert_eq!(lines[2]["decision"]["decision"], "allowed");
        assert_eq!(lines[3]["decision"]["decision"], "skipped");
    }

    #[test]
    fn test_invalid_record_reports_line() {
        let input = "{\"path\": \"/\"}\nnot json\n";
        let result = replay(&limiter(1.0, 1), input.as_bytes(), Vec::new());

        assert!(matches!(result, Err(TollgateError::Record { line: 2, .. })));
    }

    #[test]
    fn test_timeline_is_relative_to_first_record() {
        let mut timeline = Timeline::default();
        let first: DateTime<Utc> = "2024-05-01T12:00:00Z".parse().unwrap();

        let base = timeline.instant_for(Some(first));
        let later = timeline.instant_for(Some(first + chrono::Duration::milliseconds(1500)));
        let earlier = timeline.instant_for(Some(first - chrono::Duration::seconds(5)));

        assert_eq!(later - base, Duration::from_millis(1500));
        assert_eq!(earlier, base);
    }
}
