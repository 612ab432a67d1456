//! Request attributes consumed by the key builder.
//!
//! The transport adapter implements [`RequestAttributes`] for its own request
//! type. [`RequestInfo`] is an owned implementation used by the replay tool
//! and in tests.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Request-scoped key/value lookup supplied by the caller.
pub trait ContextLookup: Send + Sync {
    /// Value stored under `key`, if any.
    fn lookup(&self, key: &str) -> Option<String>;
}

impl ContextLookup for HashMap<String, String> {
    fn lookup(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

impl ContextLookup for BTreeMap<String, String> {
    fn lookup(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Read access to the parts of an inbound request that can take part in a
/// rate limit key.
pub trait RequestAttributes {
    /// URL path, without the query string.
    fn path(&self) -> &str;

    /// HTTP method, e.g. `GET`.
    fn method(&self) -> &str;

    /// All values of the header `name`. Lookup is case-insensitive and
    /// values are returned in the order they appeared on the request.
    fn header_values(&self, name: &str) -> Vec<&str>;

    /// Username from basic-auth credentials, if present.
    fn basic_auth_user(&self) -> Option<&str>;

    /// Raw peer address, usually `ip:port`.
    fn remote_addr(&self) -> Option<&str>;

    /// Request-scoped context values.
    fn context(&self) -> Option<&dyn ContextLookup> {
        None
    }
}

/// An owned request description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    /// HTTP method
    #[serde(default = "default_method")]
    pub method: String,
    /// URL path
    #[serde(default = "default_path")]
    pub path: String,
    /// Peer address
    #[serde(default)]
    pub remote_addr: Option<String>,
    /// Header name to values, in arrival order
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Basic-auth username
    #[serde(default)]
    pub basic_auth_user: Option<String>,
    /// Request-scoped context values
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

impl RequestInfo {
    /// Create a request with the given method and path.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the peer address.
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Append a header value.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the basic-auth username.
    pub fn with_basic_auth_user(mut self, user: impl Into<String>) -> Self {
        self.basic_auth_user = Some(user.into());
        self
    }

    /// Set a context value.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl RequestAttributes for RequestInfo {
    fn path(&self) -> &str {
        &self.path
    }

    fn method(&self) -> &str {
        &self.method
    }

    fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    fn basic_auth_user(&self) -> Option<&str> {
        self.basic_auth_user.as_deref()
    }

    fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    fn context(&self) -> Option<&dyn ContextLookup> {
        if self.context.is_empty() {
            None
        } else {
            Some(&self.context)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let request = RequestInfo::new("GET", "/")
            .with_header("X-Forwarded-For", "8.8.8.8")
            .with_header("x-forwarded-for", "10.10.10.10");

        assert_eq!(
            request.header_values("X-FORWARDED-FOR"),
            vec!["8.8.8.8", "10.10.10.10"]
        );
        assert!(request.header_values("X-Real-IP").is_empty());
    }

    #[test]
    fn test_context_lookup() {
        let request = RequestInfo::new("GET", "/").with_context("tier", "basic");
        let context = request.context().unwrap();

        assert_eq!(context.lookup("tier"), Some("basic".to_string()));
        assert_eq!(context.lookup("missing"), None);
        assert!(RequestInfo::new("GET", "/").context().is_none());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{"path": "/api", "headers": [["X-Real-IP", "1.2.3.4"]]}"#;
        let request: RequestInfo = serde_json::from_str(json).unwrap();

        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/api");
        assert_eq!(request.header_values("x-real-ip"), vec!["1.2.3.4"]);
        assert!(request.remote_addr.is_none());
    }
}
