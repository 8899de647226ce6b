//! Request classification: who is calling, and which route they are hitting.
//!
//! Every counter the engine keeps is scoped by a [`ClientKey`] and, for the endpoint tier,
//! an [`EndpointKey`]. Both are derived here from the inbound request without any I/O.

use http::{HeaderMap, Request};
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// Request extension carrying the authenticated principal, inserted by whatever
/// authentication layer runs before the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Request extension carrying the transport-level peer address.
///
/// Servers that expose the peer as a bare `SocketAddr` extension are also understood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";
const UNKNOWN_CLIENT: &str = "unknown";
const ID_PLACEHOLDER: &str = "{id}";

/// Identity every counter is scoped to: `user:<id>` or `ip:<address>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    pub fn user(id: &str) -> Self {
        ClientKey(format!("user:{id}"))
    }

    pub fn ip(addr: &str) -> Self {
        ClientKey(format!("ip:{addr}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broad endpoint class used to pick default limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    Auth,
    Api,
    Other,
}

/// Security-sensitive operations with their own per-client tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityOperation {
    Login,
    PasswordReset,
    Registration,
}

impl SecurityOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityOperation::Login => "login",
            SecurityOperation::PasswordReset => "password_reset",
            SecurityOperation::Registration => "registration",
        }
    }
}

/// `METHOD:/normalized/path` with identifiers collapsed to `{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey(String);

impl EndpointKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// HTTP method portion.
    pub fn method(&self) -> &str {
        self.0.split_once(':').map(|(method, _)| method).unwrap_or("")
    }

    /// Normalized path portion.
    pub fn path(&self) -> &str {
        self.0.split_once(':').map(|(_, path)| path).unwrap_or(&self.0)
    }

    pub fn class(&self) -> EndpointClass {
        let path = self.path();
        if path.contains("/auth/") {
            EndpointClass::Auth
        } else if path == "/api" || path.starts_with("/api/") {
            EndpointClass::Api
        } else {
            EndpointClass::Other
        }
    }

    /// Which security tier, if any, this route belongs to.
    pub fn security_operation(&self) -> Option<SecurityOperation> {
        let path = self.path();
        if path.contains("password/reset") {
            return Some(SecurityOperation::PasswordReset);
        }
        for segment in path.split('/') {
            match segment {
                "login" | "signin" | "sign-in" => return Some(SecurityOperation::Login),
                "password-reset" | "reset-password" | "forgot-password" => {
                    return Some(SecurityOperation::PasswordReset)
                }
                "register" | "registration" | "signup" | "sign-up" => {
                    return Some(SecurityOperation::Registration)
                }
                _ => {}
            }
        }
        None
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the client key for a request. Never fails.
///
/// Order: authenticated user, first `X-Forwarded-For` entry, `X-Real-IP`, peer address,
/// then `ip:unknown`.
pub fn derive_client_key<B>(req: &Request<B>) -> ClientKey {
    if let Some(AuthenticatedUser(id)) = req.extensions().get::<AuthenticatedUser>() {
        if !id.is_empty() {
            return ClientKey::user(id);
        }
    }
    if let Some(ip) = header_ip(req.headers()) {
        return ClientKey::ip(&ip);
    }
    let peer = req
        .extensions()
        .get::<PeerAddr>()
        .map(|PeerAddr(addr)| *addr)
        .or_else(|| req.extensions().get::<SocketAddr>().copied());
    match peer {
        Some(addr) => ClientKey::ip(&addr.ip().to_string()),
        None => ClientKey::ip(UNKNOWN_CLIENT),
    }
}

fn header_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return Some(ip.to_string());
    }
    headers
        .get(REAL_IP)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Collapse identifiers and case so structurally identical routes share one key.
pub fn normalize_endpoint(method: &str, path: &str) -> EndpointKey {
    let path = path.split(['?', '#']).next().unwrap_or("");
    let path = match path {
        "" => "/",
        "/" => path,
        _ => path.strip_suffix('/').unwrap_or(path),
    };
    let normalized = path
        .split('/')
        .map(|segment| {
            if is_identifier(segment) {
                ID_PLACEHOLDER.to_string()
            } else {
                segment.to_lowercase()
            }
        })
        .collect::<Vec<_>>()
        .join("/");
    EndpointKey(format!("{}:{}", method.to_ascii_uppercase(), normalized))
}

fn is_identifier(segment: &str) -> bool {
    is_integer(segment) || Uuid::parse_str(segment).is_ok()
}

/// Any base-10 integer, however long; ids are not bounded by a machine word.
fn is_integer(segment: &str) -> bool {
    let digits = segment.strip_prefix(['-', '+']).unwrap_or(segment);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

const SKIPPED_PREFIXES: &[&str] = &[
    "/health",
    "/healthz",
    "/ready",
    "/live",
    "/metrics",
    "/swagger",
    "/docs",
    "/api-docs",
    "/openapi",
    "/openapi.json",
    "/static",
    "/assets",
    "/hubs",
    "/ws",
    "/favicon.ico",
    "/robots.txt",
];

const STATIC_EXTENSIONS: &[&str] =
    &["css", "js", "map", "png", "jpg", "jpeg", "gif", "svg", "ico", "woff", "woff2", "ttf"];

/// Paths that bypass rate limiting entirely: health, metrics, docs, static assets and
/// websocket hubs.
pub fn should_skip(path: &str) -> bool {
    let path = path.to_ascii_lowercase();
    let under_prefix = SKIPPED_PREFIXES.iter().any(|prefix| {
        path == *prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
    });
    if under_prefix {
        return true;
    }
    path.rsplit('/')
        .next()
        .and_then(|last| last.rsplit_once('.'))
        .is_some_and(|(_, ext)| STATIC_EXTENSIONS.contains(&ext))
}
