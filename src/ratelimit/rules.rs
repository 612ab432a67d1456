//! Rule set describing which request attributes make up a rate limit key.
//!
//! A [`RuleSet`] is immutable once built. Changes at runtime go through
//! [`RuleSet::to_builder`] and a fresh [`RuleSetBuilder::build`], and the
//! result replaces the old rule set as a whole.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

/// Default lifetime of an idle token bucket (10 years, i.e. never in practice).
pub const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(87_600 * 3600);
/// Default interval between expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Default status code for rejected requests.
pub const DEFAULT_STATUS_CODE: u16 = 429;
/// Default body for rejected requests.
pub const DEFAULT_MESSAGE: &str = "You have reached maximum request limit.";
/// Default content type for rejected requests.
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

const REMOTE_ADDR: &str = "RemoteAddr";

/// A place to look for the client address.
///
/// The string form is `RemoteAddr` for the peer address, or a header name
/// optionally followed by `:<index-from-right>` (e.g. `X-Forwarded-For:1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IpLookup {
    /// The peer address of the connection
    RemoteAddr,
    /// A header holding one or more comma-separated addresses
    Header {
        /// Header name
        name: String,
        /// Which address to take, counting from the right (0 = last)
        index_from_right: usize,
    },
}

impl IpLookup {
    /// Look in header `name`, taking the rightmost address.
    pub fn header(name: impl Into<String>) -> Self {
        IpLookup::Header {
            name: name.into(),
            index_from_right: 0,
        }
    }

    /// Look in header `name`, skipping `index_from_right` trusted hops.
    pub fn header_from_right(name: impl Into<String>, index_from_right: usize) -> Self {
        IpLookup::Header {
            name: name.into(),
            index_from_right,
        }
    }

    /// The default lookup order: peer address, then `X-Forwarded-For`, then
    /// `X-Real-IP`.
    pub fn default_order() -> Vec<IpLookup> {
        vec![
            IpLookup::RemoteAddr,
            IpLookup::header("X-Forwarded-For"),
            IpLookup::header("X-Real-IP"),
        ]
    }
}

impl FromStr for IpLookup {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TollgateError::Config("IP lookup must not be empty".to_string()));
        }
        if s.eq_ignore_ascii_case(REMOTE_ADDR) {
            return Ok(IpLookup::RemoteAddr);
        }

        match s.split_once(':') {
            None => Ok(IpLookup::header(s)),
            Some((name, index)) => {
                let index = index.trim().parse::<usize>().map_err(|e| {
                    TollgateError::Config(format!("invalid index in IP lookup '{}': {}", s, e))
                })?;
                Ok(IpLookup::header_from_right(name.trim(), index))
            }
        }
    }
}

impl TryFrom<String> for IpLookup {
    type Error = TollgateError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<IpLookup> for String {
    fn from(lookup: IpLookup) -> Self {
        lookup.to_string()
    }
}

impl fmt::Display for IpLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpLookup::RemoteAddr => f.write_str(REMOTE_ADDR),
            IpLookup::Header {
                name,
                index_from_right: 0,
            } => f.write_str(name),
            IpLookup::Header {
                name,
                index_from_right,
            } => write!(f, "{}:{}", name, index_from_right),
        }
    }
}

/// Validated, immutable limiter configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    rate_per_second: f64,
    burst: u32,
    ip_lookups: Vec<IpLookup>,
    methods: BTreeSet<String>,
    headers: BTreeMap<String, BTreeSet<String>>,
    basic_auth_users: BTreeSet<String>,
    context_values: BTreeMap<String, BTreeSet<String>>,
    ignore_path: bool,
    entry_ttl: Duration,
    sweep_interval: Duration,
    status_code: u16,
    message: String,
    content_type: String,
}

impl RuleSet {
    /// Start building a rule set with the given sustained rate and burst.
    pub fn builder(rate_per_second: f64, burst: u32) -> RuleSetBuilder {
        RuleSetBuilder::new(rate_per_second, burst)
    }

    /// A builder seeded with this rule set's values.
    pub fn to_builder(&self) -> RuleSetBuilder {
        RuleSetBuilder {
            rules: self.clone(),
        }
    }

    /// Average sustained admission rate.
    pub fn rate_per_second(&self) -> f64 {
        self.rate_per_second
    }

    /// Maximum instantaneous tokens.
    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Ordered client address sources.
    pub fn ip_lookups(&self) -> &[IpLookup] {
        &self.ip_lookups
    }

    /// Methods that are limited. Empty means all methods.
    pub fn methods(&self) -> &BTreeSet<String> {
        &self.methods
    }

    /// Header rules: header name to allowed values (empty = any value).
    pub fn headers(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.headers
    }

    /// Basic-auth usernames that are limited.
    pub fn basic_auth_users(&self) -> &BTreeSet<String> {
        &self.basic_auth_users
    }

    /// Context rules: context key to allowed values (empty = any value).
    pub fn context_values(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.context_values
    }

    /// Whether the path is left out of keys.
    pub fn ignore_path(&self) -> bool {
        self.ignore_path
    }

    /// Lifetime of an idle token bucket.
    pub fn entry_ttl(&self) -> Duration {
        self.entry_ttl
    }

    /// Interval between expiry sweeps.
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Status code for rejected requests.
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Body for rejected requests.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Content type of the rejection body.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Whether any header, context or basic-auth rule is configured.
    pub fn has_attribute_rules(&self) -> bool {
        !self.headers.is_empty()
            || !self.context_values.is_empty()
            || !self.basic_auth_users.is_empty()
    }
}

/// Chainable builder for [`RuleSet`]. Validation happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct RuleSetBuilder {
    rules: RuleSet,
}

impl RuleSetBuilder {
    /// Create a builder with default settings for everything except the rate.
    pub fn new(rate_per_second: f64, burst: u32) -> Self {
        Self {
            rules: RuleSet {
                rate_per_second,
                burst,
                ip_lookups: IpLookup::default_order(),
                methods: BTreeSet::new(),
                headers: BTreeMap::new(),
                basic_auth_users: BTreeSet::new(),
                context_values: BTreeMap::new(),
                ignore_path: false,
                entry_ttl: DEFAULT_ENTRY_TTL,
                sweep_interval: DEFAULT_SWEEP_INTERVAL,
                status_code: DEFAULT_STATUS_CODE,
                message: DEFAULT_MESSAGE.to_string(),
                content_type: DEFAULT_CONTENT_TYPE.to_string(),
            },
        }
    }

    /// Set the sustained rate.
    pub fn rate_per_second(mut self, rate: f64) -> Self {
        self.rules.rate_per_second = rate;
        self
    }

    /// Set the burst size.
    pub fn burst(mut self, burst: u32) -> Self {
        self.rules.burst = burst;
        self
    }

    /// Replace the client address lookup order.
    pub fn ip_lookups(mut self, lookups: impl IntoIterator<Item = IpLookup>) -> Self {
        self.rules.ip_lookups = lookups.into_iter().collect();
        self
    }

    /// Replace the set of limited methods.
    pub fn methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    /// Add allowed values to a header rule, creating it if needed.
    ///
    /// An empty value list means any value of the header triggers limiting.
    pub fn header<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules
            .headers
            .entry(name.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Drop a header rule entirely.
    pub fn remove_header(mut self, name: &str) -> Self {
        self.rules.headers.remove(name);
        self
    }

    /// Remove some allowed values from a header rule.
    pub fn remove_header_entries<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if let Some(entries) = self.rules.headers.get_mut(name) {
            for value in values {
                entries.remove(value.as_ref());
            }
        }
        self
    }

    /// Add limited basic-auth usernames.
    pub fn basic_auth_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules
            .basic_auth_users
            .extend(users.into_iter().map(Into::into));
        self
    }

    /// Remove limited basic-auth usernames.
    pub fn remove_basic_auth_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for user in users {
            self.rules.basic_auth_users.remove(user.as_ref());
        }
        self
    }

    /// Add allowed values to a context rule, creating it if needed.
    pub fn context_value<I, S>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules
            .context_values
            .entry(key.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Drop a context rule entirely.
    pub fn remove_context_value(mut self, key: &str) -> Self {
        self.rules.context_values.remove(key);
        self
    }

    /// Leave the path out of keys, limiting per client across all paths.
    pub fn ignore_path(mut self, ignore: bool) -> Self {
        self.rules.ignore_path = ignore;
        self
    }

    /// Set the idle lifetime of token buckets.
    pub fn entry_ttl(mut self, ttl: Duration) -> Self {
        self.rules.entry_ttl = ttl;
        self
    }

    /// Set the sweep interval.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.rules.sweep_interval = interval;
        self
    }

    /// Set the rejection status code.
    pub fn status_code(mut self, status_code: u16) -> Self {
        self.rules.status_code = status_code;
        self
    }

    /// Set the rejection body.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.rules.message = message.into();
        self
    }

    /// Set the rejection content type.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.rules.content_type = content_type.into();
        self
    }

    /// Validate and produce the rule set.
    pub fn build(self) -> Result<RuleSet> {
        let rules = self.rules;

        if !rules.rate_per_second.is_finite() || rules.rate_per_second <= 0.0 {
            return Err(TollgateError::Config(format!(
                "rate_per_second must be a positive number, got {}",
                rules.rate_per_second
            )));
        }
        if rules.burst < 1 {
            return Err(TollgateError::Config("burst must be at least 1".to_string()));
        }
        if rules.entry_ttl.is_zero() {
            return Err(TollgateError::Config(
                "entry_ttl must be greater than zero".to_string(),
            ));
        }
        if rules.sweep_interval.is_zero() {
            return Err(TollgateError::Config(
                "sweep_interval must be greater than zero".to_string(),
            ));
        }
        if !(100..=599).contains(&rules.status_code) {
            return Err(TollgateError::Config(format!(
                "status_code must be a valid HTTP status, got {}",
                rules.status_code
            )));
        }

        Ok(rules)
    }
}

impl Default for RuleSetBuilder {
    fn default() -> Self {
        Self::new(1.0, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let rules = RuleSet::builder(1.0, 1).build().unwrap();

        assert_eq!(rules.ip_lookups(), IpLookup::default_order().as_slice());
        assert_eq!(rules.entry_ttl(), DEFAULT_ENTRY_TTL);
        assert_eq!(rules.sweep_interval(), Duration::from_secs(60));
        assert_eq!(rules.status_code(), 429);
        assert_eq!(rules.message(), "You have reached maximum request limit.");
        assert_eq!(rules.content_type(), "text/plain; charset=utf-8");
        assert!(!rules.has_attribute_rules());
        assert!(!rules.ignore_path());
    }

    #[test]
    fn test_invalid_rate_rejected() {
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let result = RuleSet::builder(rate, 1).build();
            assert!(matches!(result, Err(TollgateError::Config(_))), "rate {}", rate);
        }
    }

    #[test]
    fn test_zero_burst_rejected() {
        assert!(RuleSet::builder(1.0, 0).build().is_err());
    }

    #[test]
    fn test_invalid_durations_and_status_rejected() {
        assert!(RuleSet::builder(1.0, 1).entry_ttl(Duration::ZERO).build().is_err());
        assert!(RuleSet::builder(1.0, 1).sweep_interval(Duration::ZERO).build().is_err());
        assert!(RuleSet::builder(1.0, 1).status_code(42).build().is_err());
        assert!(RuleSet::builder(1.0, 1).status_code(503).build().is_ok());
    }

    #[test]
    fn test_header_rules_accumulate_and_remove() {
        let rules = RuleSet::builder(1.0, 1)
            .header("X-Auth-Token", ["secret1"])
            .header("X-Auth-Token", ["secret2", "secret3"])
            .remove_header_entries("X-Auth-Token", ["secret3"])
            .header("user_id", Vec::<String>::new())
            .build()
            .unwrap();

        let token_values: Vec<&str> = rules.headers()["X-Auth-Token"]
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(token_values, vec!["secret1", "secret2"]);
        assert!(rules.headers()["user_id"].is_empty());

        let rules = rules.to_builder().remove_header("user_id").build().unwrap();
        assert_eq!(rules.headers().len(), 1);
    }

    #[test]
    fn test_basic_auth_and_context_edits() {
        let rules = RuleSet::builder(1.0, 1)
            .basic_auth_users(["bob", "alice"])
            .remove_basic_auth_users(["alice"])
            .context_value("API-access-level", ["basic"])
            .build()
            .unwrap();

        assert_eq!(rules.basic_auth_users().len(), 1);
        assert!(rules.basic_auth_users().contains("bob"));
        assert!(rules.has_attribute_rules());

        let rules = rules
            .to_builder()
            .remove_context_value("API-access-level")
            .remove_basic_auth_users(["bob"])
            .build()
            .unwrap();
        assert!(!rules.has_attribute_rules());
    }

    #[test]
    fn test_ip_lookup_parsing() {
        assert_eq!("RemoteAddr".parse::<IpLookup>().unwrap(), IpLookup::RemoteAddr);
        assert_eq!(
            "X-Real-IP".parse::<IpLookup>().unwrap(),
            IpLookup::header("X-Real-IP")
        );
        assert_eq!(
            "X-Forwarded-For:2".parse::<IpLookup>().unwrap(),
            IpLookup::header_from_right("X-Forwarded-For", 2)
        );
        assert!("X-Forwarded-For:abc".parse::<IpLookup>().is_err());
        assert!("".parse::<IpLookup>().is_err());
    }

    #[test]
    fn test_ip_lookup_display_round_trips_through_yaml() {
        let lookups = vec![
            IpLookup::RemoteAddr,
            IpLookup::header_from_right("X-Forwarded-For", 1),
        ];
        let yaml = serde_yaml::to_string(&lookups).unwrap();
        assert!(yaml.contains("X-Forwarded-For:1"));

        let parsed: Vec<IpLookup> = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, lookups);
    }
}
