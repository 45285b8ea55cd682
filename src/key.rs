//! Bucket identity: which counter a request is charged against.
//!
//! A [`BucketKey`] is `{route}:{client}`. The route is the first path segment; the client
//! is the most specific identity the request carries:
//!
//! 1. `user:{id}` when an upstream authentication layer attached an [`AuthenticatedUser`],
//! 2. `api:{key}` when an `X-API-Key` header is present,
//! 3. `ip:{addr}:agent:{hash}` otherwise.
//!
//! ```
//! use tollgate::key::{BucketKey, RequestContext};
//!
//! let request = http::Request::builder()
//!     .uri("/orders/42")
//!     .header("X-API-Key", "abc123")
//!     .body(())
//!     .unwrap();
//! let ctx = RequestContext::from_request(&request);
//! assert_eq!(BucketKey::for_request(&ctx).as_str(), "orders:api:abc123");
//! ```

use crate::policy::ClientClass;
use http::HeaderMap;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Route id used when the path has no first segment (e.g. `/`).
pub const ROOT_ROUTE: &str = "root";

/// Header carrying an API key.
pub const API_KEY_HEADER: &str = "x-api-key";

const UNKNOWN: &str = "unknown";

/// Identity resolved by an authentication layer that runs before admission.
///
/// Insert it into the request extensions; the rate limiter never inspects credentials
/// itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthenticatedUser(pub String);

/// The client a request is charged to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientIdentity {
    /// Authenticated user id.
    User(String),
    /// API key presented by the caller.
    ApiKey(String),
    /// Caller known only by address and a hash of its user agent.
    Anonymous { ip: String, agent_hash: String },
}

impl ClientIdentity {
    /// Class used for per-client policy overrides.
    pub fn class(&self) -> ClientClass {
        match self {
            ClientIdentity::User(_) => ClientClass::User,
            ClientIdentity::ApiKey(_) => ClientClass::ApiKey,
            ClientIdentity::Anonymous { .. } => ClientClass::Anonymous,
        }
    }

    /// Pick the most specific identity available in `ctx`.
    pub fn resolve(ctx: &RequestContext<'_>) -> Self {
        if let Some(user) = ctx.user.map(|u| u.0.trim()).filter(|id| !id.is_empty()) {
            return ClientIdentity::User(user.to_string());
        }
        if let Some(api_key) = header_text(ctx.headers, API_KEY_HEADER) {
            return ClientIdentity::ApiKey(api_key.to_string());
        }
        let ip = ctx.remote_ip.map_or_else(|| UNKNOWN.to_string(), |ip| ip.to_string());
        let agent_hash = header_bytes(ctx.headers, http::header::USER_AGENT.as_str())
            .map_or_else(|| UNKNOWN.to_string(), agent_hash);
        ClientIdentity::Anonymous { ip, agent_hash }
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientIdentity::User(id) => write!(f, "user:{id}"),
            ClientIdentity::ApiKey(key) => write!(f, "api:{key}"),
            ClientIdentity::Anonymous { ip, agent_hash } => write!(f, "ip:{ip}:agent:{agent_hash}"),
        }
    }
}

/// Opaque name of one rate-limit counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey(String);

impl BucketKey {
    /// `{route}:{identity}`. A `:` or `%` inside the route is percent-escaped, so the
    /// first `:` always ends the route and no two (route, client) pairs share a key.
    pub fn new(route_id: &str, identity: &ClientIdentity) -> Self {
        BucketKey(format!("{}:{identity}", escape_route(route_id)))
    }

    /// Key for the request described by `ctx`.
    pub fn for_request(ctx: &RequestContext<'_>) -> Self {
        Self::new(route_id(ctx.path), &ClientIdentity::resolve(ctx))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BucketKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The parts of a request the key policy looks at.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub remote_ip: Option<IpAddr>,
    pub user: Option<&'a AuthenticatedUser>,
}

impl<'a> RequestContext<'a> {
    /// Borrow what is needed from an `http::Request`. The remote address is read from a
    /// `SocketAddr` extension, as inserted by most servers' connect-info hooks.
    pub fn from_request<B>(request: &'a http::Request<B>) -> Self {
        Self {
            path: request.uri().path(),
            headers: request.headers(),
            remote_ip: request.extensions().get::<SocketAddr>().map(SocketAddr::ip),
            user: request.extensions().get::<AuthenticatedUser>(),
        }
    }
}

/// First path segment, or [`ROOT_ROUTE`] when there is none.
pub fn route_id(path: &str) -> &str {
    let rest = path.strip_prefix('/').unwrap_or(path);
    match rest.split('/').next() {
        Some(segment) if !segment.is_empty() => segment,
        _ => ROOT_ROUTE,
    }
}

fn escape_route(route_id: &str) -> Cow<'_, str> {
    if route_id.contains([':', '%']) {
        Cow::Owned(route_id.replace('%', "%25").replace(':', "%3A"))
    } else {
        Cow::Borrowed(route_id)
    }
}

fn header_text<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    let value = headers.get(name)?;
    match value.to_str() {
        Ok(text) => Some(text.trim()).filter(|text| !text.is_empty()),
        Err(_) => {
            // the value may be a credential, so only the header name is logged
            tracing::debug!(target: "tollgate::key", header = name, "ignoring header with non-visible characters");
            None
        }
    }
}

// Opaque bytes are fine for hashing.
fn header_bytes<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h [u8]> {
    let value = headers.get(name)?;
    let bytes = match value.to_str() {
        Ok(text) => text.trim().as_bytes(),
        Err(_) => value.as_bytes(),
    };
    Some(bytes).filter(|bytes| !bytes.is_empty())
}

// Stable across processes so every instance derives the same key for the same agent.
fn agent_hash(user_agent: &[u8]) -> String {
    let digest = Sha256::digest(user_agent);
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}
