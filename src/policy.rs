//! Rate limit policies and their resolution per route and client class.
//!
//! Settings are plain serde structs loaded once at startup. [`PolicyResolver::from_settings`]
//! validates them into immutable [`RateLimitPolicy`] values; after that, resolution is a
//! read-only lookup that is safe to share across tasks behind an `Arc`.
//!
//! Resolution order for a request on route `r` by a client of class `c`:
//!
//! 1. an explicit route policy attached to the admission layer, else
//! 2. `routes[r]` from the settings, else
//! 3. the global `default`;
//!
//! then, inside the chosen route policy, the override for `c` if one is configured.
//!
//! ```
//! use tollgate::policy::{ClientClass, PolicyResolver, RateLimitSettings};
//!
//! let settings = RateLimitSettings::from_json(r#"{
//!     "default": { "capacity": 100, "refill_tokens": 1, "refill_period_ms": 1000 },
//!     "routes": {
//!         "orders": {
//!             "capacity": 20, "refill_tokens": 2, "refill_period_ms": 1000,
//!             "api": { "capacity": 50, "refill_tokens": 5 }
//!         }
//!     }
//! }"#).unwrap();
//! let resolver = PolicyResolver::from_settings(&settings).unwrap();
//!
//! assert_eq!(resolver.resolve("orders", ClientClass::ApiKey, None).capacity(), 50);
//! assert_eq!(resolver.resolve("orders", ClientClass::Anonymous, None).capacity(), 20);
//! assert_eq!(resolver.resolve("billing", ClientClass::User, None).capacity(), 100);
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Validated token-bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    capacity: u32,
    refill_tokens: u32,
    refill_period: Duration,
}

impl RateLimitPolicy {
    /// Create a policy; every parameter must be positive. The period is kept at
    /// millisecond resolution, so sub-millisecond periods are rejected too.
    pub fn new(
        capacity: u32,
        refill_tokens: u32,
        refill_period: Duration,
    ) -> Result<Self, ConfigError> {
        Self::validated("policy", capacity, refill_tokens, refill_period)
    }

    fn validated(
        scope: &str,
        capacity: u32,
        refill_tokens: u32,
        refill_period: Duration,
    ) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::non_positive(format!("{scope}.capacity"), 0));
        }
        if refill_tokens == 0 {
            return Err(ConfigError::non_positive(format!("{scope}.refill_tokens"), 0));
        }
        let period_ms = u64::try_from(refill_period.as_millis()).unwrap_or(u64::MAX);
        if period_ms == 0 {
            return Err(ConfigError::non_positive(format!("{scope}.refill_period_ms"), 0));
        }
        Ok(Self { capacity, refill_tokens, refill_period: Duration::from_millis(period_ms) })
    }

    /// Maximum number of tokens the bucket holds.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tokens added per elapsed period.
    pub fn refill_tokens(&self) -> u32 {
        self.refill_tokens
    }

    /// Length of one refill period.
    pub fn refill_period(&self) -> Duration {
        self.refill_period
    }

    /// Refill period in whole milliseconds (always > 0).
    pub fn refill_period_millis(&self) -> u64 {
        u64::try_from(self.refill_period.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Class of client a bucket belongs to, used to pick a per-class override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientClass {
    /// Authenticated user.
    User,
    /// Caller presenting an API key.
    ApiKey,
    /// Anonymous caller identified by address and user agent.
    Anonymous,
}

/// Route policy with optional per-class overrides, all validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePolicy {
    base: RateLimitPolicy,
    user: Option<RateLimitPolicy>,
    api_key: Option<RateLimitPolicy>,
    anonymous: Option<RateLimitPolicy>,
}

impl RoutePolicy {
    /// Route policy without class overrides.
    pub fn new(base: RateLimitPolicy) -> Self {
        Self { base, user: None, api_key: None, anonymous: None }
    }

    /// Attach an override for one client class.
    pub fn with_class(mut self, class: ClientClass, policy: RateLimitPolicy) -> Self {
        match class {
            ClientClass::User => self.user = Some(policy),
            ClientClass::ApiKey => self.api_key = Some(policy),
            ClientClass::Anonymous => self.anonymous = Some(policy),
        }
        self
    }

    /// Policy applying to `class` on this route.
    pub fn for_class(&self, class: ClientClass) -> &RateLimitPolicy {
        let specific = match class {
            ClientClass::User => self.user.as_ref(),
            ClientClass::ApiKey => self.api_key.as_ref(),
            ClientClass::Anonymous => self.anonymous.as_ref(),
        };
        specific.unwrap_or(&self.base)
    }

    /// Policy used when no class override applies.
    pub fn base(&self) -> &RateLimitPolicy {
        &self.base
    }

    /// Validate settings into a route policy. `scope` prefixes field names in errors.
    pub fn from_settings(scope: &str, settings: &RouteSettings) -> Result<Self, ConfigError> {
        let base = RateLimitPolicy::validated(
            scope,
            settings.capacity,
            settings.refill_tokens,
            Duration::from_millis(settings.refill_period_ms),
        )?;
        let class = |name: &str, over: &Option<ClassSettings>| {
            over.as_ref()
                .map(|o| {
                    let period = o.refill_period_ms.unwrap_or(settings.refill_period_ms);
                    RateLimitPolicy::validated(
                        &format!("{scope}.{name}"),
                        o.capacity,
                        o.refill_tokens,
                        Duration::from_millis(period),
                    )
                })
                .transpose()
        };
        Ok(Self {
            base,
            user: class("user", &settings.user)?,
            api_key: class("api", &settings.api)?,
            anonymous: class("ip", &settings.ip)?,
        })
    }
}

/// Serialized form of a route policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSettings {
    pub capacity: u32,
    pub refill_tokens: u32,
    pub refill_period_ms: u64,
    /// Override for authenticated users.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<ClassSettings>,
    /// Override for API-key callers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ClassSettings>,
    /// Override for anonymous callers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<ClassSettings>,
}

impl Default for RouteSettings {
    /// 100 tokens, one token per second, no class overrides.
    fn default() -> Self {
        Self {
            capacity: 100,
            refill_tokens: 1,
            refill_period_ms: 1_000,
            user: None,
            api: None,
            ip: None,
        }
    }
}

/// Serialized per-class override. The period falls back to the route's period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassSettings {
    pub capacity: u32,
    pub refill_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refill_period_ms: Option<u64>,
}

/// Top-level rate limit configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitSettings {
    /// Global default, required.
    pub default: RouteSettings,
    /// Per-route policies keyed by route id (first path segment).
    #[serde(default)]
    pub routes: HashMap<String, RouteSettings>,
}

impl RateLimitSettings {
    /// Parse settings from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read and parse a JSON settings file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_json(&text)
    }
}

/// Immutable, validated policy table.
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    default: RoutePolicy,
    routes: HashMap<String, RoutePolicy>,
}

impl PolicyResolver {
    /// Validate every policy in `settings`. Any zero value is a [`ConfigError`].
    pub fn from_settings(settings: &RateLimitSettings) -> Result<Self, ConfigError> {
        let default = RoutePolicy::from_settings("default", &settings.default)?;
        let routes = settings
            .routes
            .iter()
            .map(|(route, route_settings)| {
                let policy = RoutePolicy::from_settings(&format!("routes.{route}"), route_settings)?;
                Ok((route.clone(), policy))
            })
            .collect::<Result<HashMap<_, _>, ConfigError>>()?;
        Ok(Self { default, routes })
    }

    /// Resolver that applies one policy everywhere.
    pub fn uniform(policy: RateLimitPolicy) -> Self {
        Self { default: RoutePolicy::new(policy), routes: HashMap::new() }
    }

    /// Route policy for `route_id`, preferring `explicit` when given.
    pub fn route<'a>(&'a self, route_id: &str, explicit: Option<&'a RoutePolicy>) -> &'a RoutePolicy {
        explicit.or_else(|| self.routes.get(route_id)).unwrap_or(&self.default)
    }

    /// Effective policy for a client of `class` on `route_id`.
    pub fn resolve<'a>(
        &'a self,
        route_id: &str,
        class: ClientClass,
        explicit: Option<&'a RoutePolicy>,
    ) -> &'a RateLimitPolicy {
        self.route(route_id, explicit).for_class(class)
    }
}
