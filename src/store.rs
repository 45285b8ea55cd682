//! Bucket storage.
//!
//! [`BucketStore`] is the only interface the admission path talks to. Two
//! implementations ship with the crate:
//!
//! - [`LocalBucketStore`]: process-local state, per-key locking. Single instance deployments.
//! - [`DistributedBucketStore`]: state in a [`SharedStore`] (e.g. Redis, see the
//!   `tollgate-redis` crate), optimistic transactions. Several gateway instances
//!   enforce one limit per key.
//!
//! Pick one at startup and hand it to the admission layer as `Arc<dyn BucketStore>`.

use crate::key::BucketKey;
use crate::policy::RateLimitPolicy;
use async_trait::async_trait;

pub mod distributed;
pub mod local;
pub mod memory;

pub use distributed::{
    DistributedBucketStore, DistributedSettings, SharedStore, TxOutcome, Write,
};
pub use local::LocalBucketStore;
pub use memory::InMemorySharedStore;

/// Key-addressed token buckets.
///
/// A key that has never been seen, or whose state was expired by the store, behaves as a
/// fully charged bucket. Both operations may be called concurrently on the same or
/// different keys.
#[async_trait]
pub trait BucketStore: Send + Sync + std::fmt::Debug {
    /// Refill the bucket named by `key` and take one token if available.
    ///
    /// Returns `false` when the bucket is empty, and also whenever the store cannot
    /// give a reliable answer (it never admits on error).
    async fn try_consume(&self, key: &BucketKey, policy: &RateLimitPolicy) -> bool;

    /// Refill the bucket, then credit `tokens` without consuming any. Clamped to capacity.
    /// `tokens == 0` is a no-op.
    async fn add_tokens(&self, key: &BucketKey, tokens: u32, policy: &RateLimitPolicy);
}
