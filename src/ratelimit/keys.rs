//! Key generation from a rule set and an inbound request.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use tracing::{debug, trace};

use super::request::RequestAttributes;
use super::rules::{IpLookup, RuleSet};

/// Separator placed between key components in the store key.
pub const KEY_SEPARATOR: &str = "|";

/// An ordered sequence of request-derived components identifying one
/// rate-limited dimension.
///
/// The first component is always the client identifier, followed by the
/// path (unless ignored), the method (when methods are restricted) and the
/// matched header, basic-auth and context discriminators.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyTuple {
    parts: Vec<String>,
}

impl KeyTuple {
    /// Create a key tuple from its components.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            parts: parts.into_iter().map(Into::into).collect(),
        }
    }

    /// The ordered components.
    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Join the components into the store key.
    pub fn to_string_key(&self) -> String {
        self.parts.join(KEY_SEPARATOR)
    }
}

impl std::fmt::Display for KeyTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// Build the key tuples a request must pass.
///
/// Returns an empty list when the rule set does not apply to the request:
/// the client address cannot be resolved, the method is not restricted, or
/// a configured header, context or basic-auth rule has no match.
///
/// Within the header (and the context) dimension each matching value yields
/// its own tuple. Across dimensions the matches are compounded into a single
/// tuple rather than limited separately. Output order is fixed by the rule
/// set's sorted rule names.
pub fn build_keys<R>(rules: &RuleSet, request: &R) -> Vec<KeyTuple>
where
    R: RequestAttributes + ?Sized,
{
    let Some(client) = resolve_client_ip(rules.ip_lookups(), request) else {
        debug!(
            path = %request.path(),
            "No client address found, request is not rate limited"
        );
        return Vec::new();
    };

    let mut base = vec![client];

    if !rules.ignore_path() {
        base.push(request.path().to_string());
    }

    if !rules.methods().is_empty() {
        let method = request.method();
        if !rules.methods().contains(method) {
            trace!(method = %method, "Method is not restricted");
            return Vec::new();
        }
        base.push(method.to_string());
    }

    if !rules.has_attribute_rules() {
        return vec![KeyTuple { parts: base }];
    }

    let header_matches = if rules.headers().is_empty() {
        vec![None]
    } else {
        let matches = match_headers(rules, request);
        if matches.is_empty() {
            trace!("No header rule matched");
            return Vec::new();
        }
        matches.into_iter().map(Some).collect()
    };

    let user = if rules.basic_auth_users().is_empty() {
        None
    } else {
        match request.basic_auth_user() {
            Some(user) if rules.basic_auth_users().contains(user) => Some(user.to_string()),
            _ => {
                trace!("No basic-auth rule matched");
                return Vec::new();
            }
        }
    };

    let context_matches = if rules.context_values().is_empty() {
        vec![None]
    } else {
        let matches = match_context(rules, request);
        if matches.is_empty() {
            trace!("No context rule matched");
            return Vec::new();
        }
        matches.into_iter().map(Some).collect()
    };

    let mut keys = Vec::with_capacity(header_matches.len() * context_matches.len());
    for header in &header_matches {
        for context in &context_matches {
            let mut parts = base.clone();
            if let Some((name, value)) = header {
                parts.push(name.clone());
                parts.push(value.clone());
            }
            if let Some(user) = &user {
                parts.push(user.clone());
            }
            if let Some((key, value)) = context {
                parts.push(key.clone());
                parts.push(value.clone());
            }
            keys.push(KeyTuple { parts });
        }
    }

    keys
}

/// Matched `(header name, value)` pairs, one per matching rule per matching
/// value.
fn match_headers<R>(rules: &RuleSet, request: &R) -> Vec<(String, String)>
where
    R: RequestAttributes + ?Sized,
{
    let mut matches = Vec::new();

    for (name, allowed) in rules.headers() {
        let values: Vec<&str> = request
            .header_values(name)
            .into_iter()
            .filter(|v| !v.is_empty())
            .collect();

        if values.is_empty() {
            continue;
        }

        if allowed.is_empty() {
            matches.push((name.clone(), values[0].to_string()));
            continue;
        }

        for value in allowed {
            if values.contains(&value.as_str()) {
                matches.push((name.clone(), value.clone()));
            }
        }
    }

    matches
}

fn match_context<R>(rules: &RuleSet, request: &R) -> Vec<(String, String)>
where
    R: RequestAttributes + ?Sized,
{
    let Some(context) = request.context() else {
        return Vec::new();
    };

    rules
        .context_values()
        .iter()
        .filter_map(|(key, allowed)| {
            let value = context.lookup(key).filter(|v| !v.is_empty())?;
            if allowed.is_empty() || allowed.contains(&value) {
                Some((key.clone(), value))
            } else {
                None
            }
        })
        .collect()
}

/// Resolve the client identifier from the first lookup that yields a value.
pub fn resolve_client_ip<R>(lookups: &[IpLookup], request: &R) -> Option<String>
where
    R: RequestAttributes + ?Sized,
{
    lookups.iter().find_map(|lookup| {
        let candidate = match lookup {
            IpLookup::RemoteAddr => request.remote_addr().map(strip_port),
            IpLookup::Header {
                name,
                index_from_right,
            } => pick_from_header(&request.header_values(name), *index_from_right),
        }?;

        if candidate.is_empty() {
            None
        } else {
            Some(canonicalize_ip(&candidate))
        }
    })
}

/// Pick one address from a comma-separated proxy chain, possibly spread over
/// several header lines. An out-of-range index falls back to the first
/// address.
fn pick_from_header(values: &[&str], index_from_right: usize) -> Option<String> {
    let addresses: Vec<&str> = values
        .iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .collect();

    let last = addresses.len().checked_sub(1)?;
    let position = last.saturating_sub(index_from_right);
    Some(addresses[position].to_string())
}

fn strip_port(addr: &str) -> String {
    let addr = addr.trim();
    match addr.parse::<SocketAddr>() {
        Ok(socket) => socket.ip().to_string(),
        Err(_) => addr.to_string(),
    }
}

/// Canonicalize an address for use in a key.
///
/// IPv6 clients usually control a whole /64, so IPv6 addresses are reduced
/// to their /64 network. IPv4 addresses and strings that are not addresses
/// are returned unchanged.
pub fn canonicalize_ip(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return v4.to_string();
            }
            let s = v6.segments();
            Ipv6Addr::new(s[0], s[1], s[2], s[3], 0, 0, 0, 0).to_string()
        }
        _ => ip.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::request::RequestInfo;

    const IPV6: &str = "2601:7:1c82:4097:59a0:a80b:2841:b8c8";
    const IPV6_NET: &str = "2601:7:1c82:4097::";

    fn request() -> RequestInfo {
        RequestInfo::new("GET", "/").with_header("X-Real-IP", "172.217.0.46")
    }

    fn rules() -> crate::ratelimit::rules::RuleSetBuilder {
        RuleSet::builder(1.0, 1)
    }

    #[test]
    fn test_key_tuple_to_string() {
        let key = KeyTuple::new(["127.0.0.1", "/", "GET"]);
        assert_eq!(key.to_string_key(), "127.0.0.1|/|GET");
        assert_eq!(key.to_string(), "127.0.0.1|/|GET");
        assert_eq!(key.parts().len(), 3);
    }

    #[test]
    fn test_default_keys_are_client_and_path() {
        let rules = rules().build().unwrap();
        let request = RequestInfo::new("GET", "/").with_header("X-Real-IP", IPV6);

        let keys = build_keys(&rules, &request);
        assert_eq!(keys, vec![KeyTuple::new([IPV6_NET, "/"])]);
    }

    #[test]
    fn test_ignore_path() {
        let rules = rules().ignore_path(true).build().unwrap();
        let keys = build_keys(&rules, &request());
        assert_eq!(keys, vec![KeyTuple::new(["172.217.0.46"])]);
    }

    #[test]
    fn test_unresolvable_client_yields_no_keys() {
        let rules = rules().build().unwrap();
        let request = RequestInfo::new("GET", "/");
        assert!(build_keys(&rules, &request).is_empty());
    }

    #[test]
    fn test_method_restriction() {
        let rules = rules().methods(["GET"]).build().unwrap();

        let keys = build_keys(&rules, &request());
        assert_eq!(keys, vec![KeyTuple::new(["172.217.0.46", "/", "GET"])]);

        let post = RequestInfo::new("POST", "/").with_header("X-Real-IP", "172.217.0.46");
        assert!(build_keys(&rules, &post).is_empty());
    }

    #[test]
    fn test_basic_auth_keys() {
        let rules = rules().basic_auth_users(["bro"]).build().unwrap();

        let request = request().with_basic_auth_user("bro");
        let keys = build_keys(&rules, &request);
        assert_eq!(keys, vec![KeyTuple::new(["172.217.0.46", "/", "bro"])]);

        let stranger = self::request().with_basic_auth_user("someone");
        assert!(build_keys(&rules, &stranger).is_empty());
        assert!(build_keys(&rules, &self::request()).is_empty());
    }

    #[test]
    fn test_custom_header_keys() {
        let rules = rules()
            .header("X-Auth-Token", ["totally-top-secret", "another-secret"])
            .build()
            .unwrap();

        let request = request().with_header("X-Auth-Token", "totally-top-secret");
        let keys = build_keys(&rules, &request);
        assert_eq!(
            keys,
            vec![KeyTuple::new([
                "172.217.0.46",
                "/",
                "X-Auth-Token",
                "totally-top-secret"
            ])]
        );
    }

    #[test]
    fn test_header_with_any_value() {
        let rules = rules()
            .methods(["POST"])
            .header("user_id", Vec::<String>::new())
            .build()
            .unwrap();

        let request = RequestInfo::new("POST", "/doesntmatter")
            .with_header("X-Real-IP", "172.217.0.46")
            .with_header("user_id", "0");
        let keys = build_keys(&rules, &request);
        assert_eq!(
            keys,
            vec![KeyTuple::new([
                "172.217.0.46",
                "/doesntmatter",
                "POST",
                "user_id",
                "0"
            ])]
        );

        let without =
            RequestInfo::new("POST", "/doesntmatter").with_header("X-Real-IP", "172.217.0.46");
        assert!(build_keys(&rules, &without).is_empty());
    }

    #[test]
    fn test_each_matching_header_rule_gets_its_own_key() {
        let rules = rules()
            .header("X-Team", ["red"])
            .header("X-Api-Key", ["k1", "k2"])
            .build()
            .unwrap();

        let request = request()
            .with_header("X-Team", "red")
            .with_header("X-Api-Key", "k2");
        let keys = build_keys(&rules, &request);

        // Sorted by header name
        assert_eq!(
            keys,
            vec![
                KeyTuple::new(["172.217.0.46", "/", "X-Api-Key", "k2"]),
                KeyTuple::new(["172.217.0.46", "/", "X-Team", "red"]),
            ]
        );
    }

    #[test]
    fn test_context_value_keys() {
        let rules = rules()
            .context_value("API-access-level", ["basic"])
            .build()
            .unwrap();

        let request = request().with_context("API-access-level", "basic");
        let keys = build_keys(&rules, &request);
        assert_eq!(
            keys,
            vec![KeyTuple::new(["172.217.0.46", "/", "API-access-level", "basic"])]
        );

        let premium = self::request().with_context("API-access-level", "premium");
        assert!(build_keys(&rules, &premium).is_empty());
    }

    #[test]
    fn test_compounding_dimensions() {
        let rules = rules()
            .methods(["GET"])
            .header("X-Auth-Token", ["secret1", "secret2"])
            .basic_auth_users(["bob"])
            .build()
            .unwrap();

        let request = RequestInfo::new("GET", "/")
            .with_header("X-Real-IP", "172.217.0.46")
            .with_header("X-Auth-Token", "secret1")
            .with_basic_auth_user("bob");
        let keys = build_keys(&rules, &request);
        assert_eq!(
            keys,
            vec![KeyTuple::new([
                "172.217.0.46",
                "/",
                "GET",
                "X-Auth-Token",
                "secret1",
                "bob"
            ])]
        );

        // Unlisted header value: the rule does not apply at all
        let unlisted = RequestInfo::new("GET", "/")
            .with_header("X-Real-IP", "172.217.0.46")
            .with_header("X-Auth-Token", "secret3")
            .with_basic_auth_user("bob");
        assert!(build_keys(&rules, &unlisted).is_empty());
    }

    #[test]
    fn test_compounding_all_dimensions() {
        let rules = rules()
            .methods(["GET"])
            .header("X-Auth-Token", ["totally-top-secret", "another-secret"])
            .context_value("API-access-level", ["basic"])
            .basic_auth_users(["bro"])
            .build()
            .unwrap();

        let request = request()
            .with_header("X-Auth-Token", "totally-top-secret")
            .with_basic_auth_user("bro")
            .with_context("API-access-level", "basic");
        let keys = build_keys(&rules, &request);
        assert_eq!(
            keys,
            vec![KeyTuple::new([
                "172.217.0.46",
                "/",
                "GET",
                "X-Auth-Token",
                "totally-top-secret",
                "bro",
                "API-access-level",
                "basic"
            ])]
        );
    }

    #[test]
    fn test_build_keys_is_deterministic() {
        let rules = rules()
            .header("X-B", Vec::<String>::new())
            .header("X-A", Vec::<String>::new())
            .header("X-C", ["1", "2"])
            .build()
            .unwrap();
        let request = request()
            .with_header("X-C", "2")
            .with_header("X-A", "a")
            .with_header("X-B", "b")
            .with_header("X-C", "1");

        let first = build_keys(&rules, &request);
        assert_eq!(first.len(), 4);
        for _ in 0..10 {
            assert_eq!(build_keys(&rules, &request), first);
        }
        assert_eq!(first[0].parts()[2], "X-A");
        assert_eq!(first[3].parts()[3], "2");
    }

    #[test]
    fn test_forwarded_for_index_from_right() {
        let request = RequestInfo::new("GET", "/")
            .with_header("X-Forwarded-For", "10.10.10.10,10.10.10.11");

        let last = [IpLookup::header("X-Forwarded-For")];
        assert_eq!(resolve_client_ip(&last, &request).as_deref(), Some("10.10.10.11"));

        let second = [IpLookup::header_from_right("X-Forwarded-For", 1)];
        assert_eq!(resolve_client_ip(&second, &request).as_deref(), Some("10.10.10.10"));

        // Out of range falls back to the first address
        let beyond = [IpLookup::header_from_right("X-Forwarded-For", 2)];
        assert_eq!(resolve_client_ip(&beyond, &request).as_deref(), Some("10.10.10.10"));
    }

    #[test]
    fn test_forwarded_for_multiple_header_lines() {
        let request = RequestInfo::new("GET", "/")
            .with_header("X-Forwarded-For", "8.8.8.8,8.8.4.4")
            .with_header("X-Forwarded-For", "10.10.10.10, 10.10.10.11");

        let lookups = [IpLookup::header("X-Forwarded-For")];
        assert_eq!(resolve_client_ip(&lookups, &request).as_deref(), Some("10.10.10.11"));
    }

    #[test]
    fn test_lookup_order_first_non_empty_wins() {
        let request = RequestInfo::new("GET", "/")
            .with_header("X-Forwarded-For", "10.10.10.10")
            .with_header("X-Real-IP", IPV6);

        let real_ip_first = [IpLookup::header("X-Real-IP"), IpLookup::header("X-Forwarded-For")];
        assert_eq!(resolve_client_ip(&real_ip_first, &request).as_deref(), Some(IPV6_NET));

        let with_remote = RequestInfo::new("GET", "/")
            .with_remote_addr("192.168.1.5:43210")
            .with_header("X-Real-IP", "");
        let lookups = [IpLookup::header("X-Real-IP"), IpLookup::RemoteAddr];
        assert_eq!(resolve_client_ip(&lookups, &with_remote).as_deref(), Some("192.168.1.5"));
    }

    #[test]
    fn test_remote_addr_port_is_stripped() {
        assert_eq!(strip_port("127.0.0.1:8080"), "127.0.0.1");
        assert_eq!(strip_port("[::1]:443"), "::1");
        assert_eq!(strip_port("10.0.0.1"), "10.0.0.1");
        assert_eq!(strip_port("unix-socket"), "unix-socket");
    }

    #[test]
    fn test_canonicalize_ip() {
        let cases = [
            ("1.2.3.4", "1.2.3.4"),
            ("not an IP", "not an IP"),
            ("not:an:IP", "not:an:IP"),
            ("", ""),
            ("2001:DB8::21f:5bff:febf:ce22:8a2e", "2001:db8:0:21f::"),
            ("2001:0db8:85a3:0000:0000:8a2e:0370:7334", "2001:db8:85a3::"),
            ("fe80::1ff:fe23:4567:890a", "fe80::"),
            ("f:f:f:f:f:f:f:f", "f:f:f:f::"),
            ("::ffff:10.0.0.1", "10.0.0.1"),
        ];

        for (ip, want) in cases {
            assert_eq!(canonicalize_ip(ip), want, "canonicalize_ip({:?})", ip);
        }
    }
}
