//! Configuration management for Tollgate.
//!
//! Settings are read from a YAML file and may be overridden by environment
//! variables prefixed with `TOLLGATE_`, using `__` between nested keys
//! (e.g. `TOLLGATE_LIMITER__BURST=5`).

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::ratelimit::{
    IpLookup, RuleSet, DEFAULT_CONTENT_TYPE, DEFAULT_ENTRY_TTL, DEFAULT_MESSAGE,
    DEFAULT_STATUS_CODE, DEFAULT_SWEEP_INTERVAL,
};

const ENV_PREFIX: &str = "TOLLGATE";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Rate and key settings
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Response sent for rejected requests
    #[serde(default)]
    pub response: ResponseConfig,
}

/// Limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Average sustained requests per second
    #[serde(default = "default_rate_per_second")]
    pub rate_per_second: f64,

    /// Requests admitted in a burst
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Where to look for the client address, in order
    #[serde(default = "IpLookup::default_order")]
    pub ip_lookups: Vec<IpLookup>,

    /// Limit only these methods; empty limits all methods
    #[serde(default)]
    pub methods: Vec<String>,

    /// Header discriminators
    #[serde(default)]
    pub headers: Vec<ValueRule>,

    /// Limit only these basic-auth users
    #[serde(default)]
    pub basic_auth_users: Vec<String>,

    /// Request context discriminators
    #[serde(default)]
    pub context_values: Vec<ValueRule>,

    /// Leave the path out of keys
    #[serde(default)]
    pub ignore_path: bool,

    /// Idle lifetime of a client's bucket in seconds
    #[serde(default = "default_entry_ttl_secs")]
    pub entry_ttl_secs: u64,

    /// Interval between idle bucket sweeps in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate_per_second: default_rate_per_second(),
            burst: default_burst(),
            ip_lookups: IpLookup::default_order(),
            methods: Vec::new(),
            headers: Vec::new(),
            basic_auth_users: Vec::new(),
            context_values: Vec::new(),
            ignore_path: false,
            entry_ttl_secs: default_entry_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// A named discriminator with its allowed values.
///
/// Names are kept as a field rather than a map key so they survive the
/// settings loader unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueRule {
    /// Header name or context key
    pub name: String,

    /// Allowed values; empty means any value
    #[serde(default)]
    pub values: Vec<String>,
}

/// Rejection response configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseConfig {
    /// HTTP status code
    #[serde(default = "default_status_code")]
    pub status_code: u16,

    /// Response body
    #[serde(default = "default_message")]
    pub message: String,

    /// Content type of the body
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            status_code: default_status_code(),
            message: default_message(),
            content_type: default_content_type(),
        }
    }
}

fn value_rules(map: &BTreeMap<String, BTreeSet<String>>) -> Vec<ValueRule> {
    map.iter()
        .map(|(name, values)| ValueRule {
            name: name.clone(),
            values: values.iter().cloned().collect(),
        })
        .collect()
}

fn default_rate_per_second() -> f64 {
    1.0
}

fn default_burst() -> u32 {
    1
}

fn default_entry_ttl_secs() -> u64 {
    DEFAULT_ENTRY_TTL.as_secs()
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL.as_secs()
}

fn default_status_code() -> u16 {
    DEFAULT_STATUS_CODE
}

fn default_message() -> String {
    DEFAULT_MESSAGE.to_string()
}

fn default_content_type() -> String {
    DEFAULT_CONTENT_TYPE.to_string()
}

impl TollgateConfig {
    /// Load configuration from a YAML file, layered under `TOLLGATE_*`
    /// environment variables.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?;

        let config: TollgateConfig = settings.try_deserialize()?;
        info!(path = %path, "Configuration loaded");
        Ok(config)
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Build a validated rule set from this configuration.
    pub fn to_rule_set(&self) -> Result<RuleSet> {
        let limiter = &self.limiter;
        let mut builder = RuleSet::builder(limiter.rate_per_second, limiter.burst)
            .ip_lookups(limiter.ip_lookups.iter().cloned())
            .methods(limiter.methods.iter().cloned())
            .basic_auth_users(limiter.basic_auth_users.iter().cloned())
            .ignore_path(limiter.ignore_path)
            .entry_ttl(Duration::from_secs(limiter.entry_ttl_secs))
            .sweep_interval(Duration::from_secs(limiter.sweep_interval_secs))
            .status_code(self.response.status_code)
            .message(self.response.message.clone())
            .content_type(self.response.content_type.clone());

        for rule in &limiter.headers {
            builder = builder.header(rule.name.clone(), rule.values.iter().cloned());
        }
        for rule in &limiter.context_values {
            builder = builder.context_value(rule.name.clone(), rule.values.iter().cloned());
        }

        builder.build()
    }

    /// The configuration equivalent to a rule set, with rules in their
    /// normalized order.
    pub fn from_rule_set(rules: &RuleSet) -> Self {
        Self {
            limiter: LimiterConfig {
                rate_per_second: rules.rate_per_second(),
                burst: rules.burst(),
                ip_lookups: rules.ip_lookups().to_vec(),
                methods: rules.methods().iter().cloned().collect(),
                headers: value_rules(rules.headers()),
                basic_auth_users: rules.basic_auth_users().iter().cloned().collect(),
                context_values: value_rules(rules.context_values()),
                ignore_path: rules.ignore_path(),
                entry_ttl_secs: rules.entry_ttl().as_secs(),
                sweep_interval_secs: rules.sweep_interval().as_secs(),
            },
            response: ResponseConfig {
                status_code: rules.status_code(),
                message: rules.message().to_string(),
                content_type: rules.content_type().to_string(),
            },
        }
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
