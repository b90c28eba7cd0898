//! Caller key resolution.
//!
//! The key a request is limited under comes from the first non-empty source,
//! strongest identity first:
//!
//! 1. `Authorization` (a `Bearer ` prefix is stripped, case-insensitively)
//! 2. `X-API-Key`
//! 3. the `session_id` cookie
//! 4. the client address: `X-Forwarded-For` (first entry), `X-Real-IP`, then
//!    the connection's remote address without its port

use axum::http::{header, HeaderMap};
use std::fmt;
use std::net::SocketAddr;

/// Cookie carrying the session identity.
pub const SESSION_COOKIE: &str = "session_id";

/// Used when a request carries no identity at all and has no peer address.
const UNKNOWN_CALLER: &str = "unknown";

const BEARER_PREFIX: &str = "bearer ";

/// A non-empty identity string a rate limit is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerKey(String);

impl CallerKey {
    /// Wrap `value`, or `None` if it is empty after trimming.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else if trimmed.len() == value.len() {
            Some(Self(value))
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// Resolve the key for a request from its headers and peer address.
    pub fn resolve(headers: &HeaderMap, remote_addr: Option<&str>) -> Self {
        let resolved = header_value(headers, header::AUTHORIZATION.as_str())
            .map(strip_bearer)
            .or_else(|| header_value(headers, "x-api-key"))
            .or_else(|| session_cookie(headers))
            .map(str::to_string)
            .or_else(|| client_address(headers, remote_addr));

        resolved
            .and_then(Self::new)
            .unwrap_or_else(|| Self(UNKNOWN_CALLER.to_string()))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A header's value, trimmed, if present, valid text and non-empty.
fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn strip_bearer(authorization: &str) -> &str {
    match authorization.get(..BEARER_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(BEARER_PREFIX) => {
            authorization[BEARER_PREFIX.len()..].trim()
        }
        _ => authorization,
    }
}

/// The `session_id` cookie across every `Cookie` header.
fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .find_map(|cookie| {
            let (name, value) = cookie.trim().split_once('=')?;
            (name.trim() == SESSION_COOKIE).then(|| value.trim())
        })
        .filter(|v| !v.is_empty())
}

/// Best guess at the client's network address.
pub fn client_address(headers: &HeaderMap, remote_addr: Option<&str>) -> Option<String> {
    if let Some(forwarded) = header_value(headers, "x-forwarded-for") {
        let first = forwarded.split(',').next().unwrap_or_default().trim();
        if !first.is_empty() {
            return Some(first.to_string());
        }
    }

    if let Some(real_ip) = header_value(headers, "x-real-ip") {
        return Some(real_ip.to_string());
    }

    remote_addr.map(strip_port)
}

/// Drop the port from `host:port` or `[v6]:port`; anything else is returned
/// verbatim.
fn strip_port(addr: &str) -> String {
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return socket.ip().to_string();
    }

    let host = match addr.strip_prefix('[') {
        Some(rest) => rest.split_once("]:").map(|(host, _)| host),
        None => addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .filter(|host| !host.contains(':')),
    };

    match host {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => addr.to_string(),
    }
}
