//! Identity extraction and counter key construction.

use std::fmt;
use std::net::IpAddr;

use http::Method;

use super::engine::{Hooks, RequestDescriptor};
use crate::config::KeyType;

/// The value used as the subject of rate limiting.
///
/// Untrusted input: safe only as an opaque string, never interpolated
/// into structured queries.
pub type Identity = String;

/// Composite key identifying one admission bucket.
///
/// Includes the matched route and method so that distinct endpoints
/// never share a bucket: an expensive endpoint's quota cannot be
/// consumed by traffic to an unrelated cheap one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub key_type: KeyType,
    pub identity: Identity,
    pub route: String,
    pub method: String,
}

impl CounterKey {
    pub fn new(key_type: KeyType, identity: Identity, route: String, method: &Method) -> Self {
        Self {
            key_type,
            identity,
            route,
            method: method.as_str().to_string(),
        }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ratelimit:{}:{}:{}:{}",
            self.key_type, self.identity, self.route, self.method
        )
    }
}

/// Extract the identity for a request.
///
/// Custom hooks take precedence over the built-in strategies: the
/// `extract_key` hook always wins, then `resolve_id`, then the strategy
/// selected by `key_type`. `None` means the caller cannot be identified
/// and the orchestrator skips limiting for the request.
pub fn extract_identity(
    req: &RequestDescriptor,
    key_type: KeyType,
    hooks: &Hooks,
    api_key_header: &str,
) -> Option<Identity> {
    if let Some(extract) = &hooks.extract_key {
        return extract(req);
    }
    if let Some(resolve) = &hooks.resolve_id {
        return resolve(req);
    }

    match key_type {
        KeyType::Ip => {
            if let Some(forwarded) = header_str(req, "x-forwarded-for") {
                // Only the first entry of a comma-separated chain names
                // the original client.
                let first = forwarded.split(',').next().unwrap_or(forwarded).trim();
                if !first.is_empty() {
                    return Some(canonicalize_ip(first));
                }
            }
            if let Some(real_ip) = header_str(req, "x-real-ip") {
                let real_ip = real_ip.trim();
                if !real_ip.is_empty() {
                    return Some(canonicalize_ip(real_ip));
                }
            }
            req.peer_addr.map(|addr| canonicalize_ip(&addr.to_string()))
        }
        KeyType::ApiKey => header_str(req, api_key_header)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string),
    }
}

/// Read a header as a string, coercing malformed values to absent.
fn header_str<'a>(req: &'a RequestDescriptor, name: &str) -> Option<&'a str> {
    req.headers.get(name).and_then(|value| value.to_str().ok())
}

/// Normalize loopback addresses to one canonical literal.
fn canonicalize_ip(value: &str) -> String {
    match value.parse::<IpAddr>() {
        Ok(ip) if ip.is_loopback() => "127.0.0.1".to_string(),
        _ => value.to_string(),
    }
}
