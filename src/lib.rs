#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tollgate
//!
//! Token-bucket admission control for API gateways.
//!
//! Every request is charged against a bucket named by its route and its client
//! (authenticated user, API key, or address plus user agent). A request that finds a
//! token proceeds; one that does not is answered with `429 Too Many Requests`.
//!
//! ## Features
//!
//! - **Local store** keeping buckets in process memory with per-key locking
//! - **Distributed store** sharing buckets between gateway instances through optimistic
//!   watch/commit transactions (see the `tollgate-redis` crate for a Redis client)
//! - **Per-route and per-client-class policies** loaded from JSON configuration
//! - **Tower middleware** that rejects over-limit requests before they reach upstream
//! - **Fail closed**: a store that errors or stalls denies the request
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tollgate::{AdmissionLayer, LocalBucketStore, PolicyResolver, RateLimitSettings};
//!
//! let settings = RateLimitSettings::from_json(r#"{
//!     "default": { "capacity": 100, "refill_tokens": 1, "refill_period_ms": 1000 },
//!     "routes": { "search": { "capacity": 10, "refill_tokens": 1, "refill_period_ms": 1000 } }
//! }"#).unwrap();
//! let policies = PolicyResolver::from_settings(&settings).unwrap();
//!
//! let layer = AdmissionLayer::new(Arc::new(LocalBucketStore::new()), Arc::new(policies));
//! # let _ = layer;
//! ```

pub mod admission;
pub mod bucket;
pub mod clock;
pub mod error;
pub mod key;
pub mod policy;
pub mod store;

#[cfg(test)]
mod test_support;

// Re-exports
pub use admission::{AdmissionControl, AdmissionLayer, AdmissionService, Verdict};
pub use bucket::BucketState;
pub use clock::{Clock, ManualClock, MonotonicClock, WallClock};
pub use error::{ConfigError, StoreError};
pub use key::{AuthenticatedUser, BucketKey, ClientIdentity, RequestContext};
pub use policy::{
    ClassSettings, ClientClass, PolicyResolver, RateLimitPolicy, RateLimitSettings, RoutePolicy,
    RouteSettings,
};
pub use store::{
    BucketStore, DistributedBucketStore, DistributedSettings, InMemorySharedStore,
    LocalBucketStore, SharedStore, TxOutcome, Write,
};
