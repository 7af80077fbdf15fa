//! Rate limit dimension keys.

use std::collections::HashMap;
use std::fmt;

use crate::endpoint::{Endpoint, EndpointId};

/// Headers consulted, in order, when resolving a client address behind
/// proxies.
pub const FORWARDED_HEADERS: [&str; 5] = [
    "X-Forwarded-For",
    "Proxy-Client-IP",
    "WL-Proxy-Client-IP",
    "HTTP_CLIENT_IP",
    "HTTP_X_FORWARDED_FOR",
];

/// The value a request contributes to its endpoint's rate limit.
///
/// For IP-based rules this is the client address; otherwise it is the
/// ordered combination of every enabled parameter and header value. Values
/// are length-prefixed so that no two distinct combinations serialize to the
/// same key, and a missing value is distinct from an empty one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimensionKey(String);

impl DimensionKey {
    pub fn for_request(
        endpoint: &Endpoint,
        client_ip: &str,
        parameters: &HashMap<String, String>,
        headers: &HashMap<String, String>,
    ) -> Self {
        if endpoint.rule.ip_based {
            return Self(format!("ip={}", client_ip));
        }

        let mut parts: Vec<String> = endpoint
            .enabled_parameters()
            .map(|p| encode("p", &p.name, parameters.get(&p.name).map(String::as_str)))
            .collect();
        parts.extend(
            endpoint
                .enabled_headers()
                .map(|h| encode("h", &h.name, header_value(headers, &h.name))),
        );
        parts.sort();
        Self(parts.join("\n"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DimensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.replace('\n', ","))
    }
}

fn encode(kind: &str, name: &str, value: Option<&str>) -> String {
    match value {
        Some(value) => format!("{}:{}={}:{}", kind, name, value.len(), value),
        None => format!("{}:{}!", kind, name),
    }
}

/// Case-insensitive header lookup.
fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Resolve the originating client address from forwarding headers, falling
/// back to the peer address.
pub fn resolve_client_ip(headers: &HashMap<String, String>, remote_addr: &str) -> String {
    FORWARDED_HEADERS
        .iter()
        .filter_map(|name| header_value(headers, name))
        .filter_map(|value| value.split(',').next())
        .map(str::trim)
        .find(|ip| !ip.is_empty() && !ip.eq_ignore_ascii_case("unknown"))
        .unwrap_or(remote_addr)
        .to_string()
}

/// A counter slot: one endpoint and one dimension value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub endpoint: EndpointId,
    pub dimension: DimensionKey,
}

impl CounterKey {
    pub fn new(endpoint: EndpointId, dimension: DimensionKey) -> Self {
        Self { endpoint, dimension }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.endpoint, self.dimension)
    }
}
