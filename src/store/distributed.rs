//! Bucket state in a shared store, guarded by optimistic transactions.
//!
//! Each bucket is two string entries:
//!
//! | entry                               | value            |
//! |-------------------------------------|------------------|
//! | `{prefix}{bucket key}`              | token count      |
//! | `{prefix}{bucket key}:last_refill`  | epoch millis     |
//!
//! Both carry a time-to-live, so idle buckets disappear and come back fully charged.
//!
//! Every operation watches both entries, reads them, runs the bucket arithmetic and
//! commits the new values only if neither entry changed in the meantime. Nothing is
//! retried by default: a lost race, a store error and a timeout all deny the request.

use super::BucketStore;
use crate::bucket::BucketState;
use crate::clock::{Clock, WallClock};
use crate::error::StoreError;
use crate::key::BucketKey;
use crate::policy::RateLimitPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const LAST_REFILL_SUFFIX: &str = ":last_refill";

/// A value to write when a transaction commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub key: String,
    pub value: String,
    pub ttl: Duration,
}

/// How a [`SharedStore::transact`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// Writes were applied.
    Committed,
    /// The plan chose not to write; the watch was released.
    Released,
    /// A watched key changed before commit; nothing was written.
    Conflict,
}

/// Client contract for the shared store behind [`DistributedBucketStore`].
///
/// Implementations must give `transact` watch-then-commit semantics: the writes returned
/// by `plan` are applied atomically, and only if none of the watched keys were modified
/// (by anyone) after they were read.
#[async_trait]
pub trait SharedStore: Send + Sync + std::fmt::Debug {
    /// Read one value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Watch `keys`, read them (same order), ask `plan` what to write, commit conditionally.
    async fn transact<F>(&self, keys: &[String], plan: F) -> Result<TxOutcome, StoreError>
    where
        F: FnOnce(Vec<Option<String>>) -> Option<Vec<Write>> + Send + 'static;
}

/// Tunables for [`DistributedBucketStore`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DistributedSettings {
    /// Prepended to every bucket key.
    pub key_prefix: String,
    /// Time-to-live applied to both entries on every write.
    pub entry_ttl_ms: u64,
    /// Upper bound on one round trip; exceeding it denies the request.
    pub timeout_ms: u64,
    /// Immediate re-attempts after losing a race. `0` denies on the first conflict.
    pub conflict_retries: u32,
}

impl Default for DistributedSettings {
    fn default() -> Self {
        Self {
            key_prefix: "rate_limit:".to_string(),
            entry_ttl_ms: 60 * 60 * 1_000,
            timeout_ms: 500,
            conflict_retries: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Consume,
    TopUp(u32),
}

/// Token buckets shared by every gateway instance pointing at the same store.
///
/// Fails closed: if the store errors or is slow, `try_consume` returns `false` and
/// `add_tokens` does nothing.
#[derive(Debug)]
pub struct DistributedBucketStore<C> {
    client: Arc<C>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    entry_ttl: Duration,
    timeout: Duration,
    conflict_retries: u32,
}

impl<C: SharedStore + 'static> DistributedBucketStore<C> {
    /// Store with default settings on the wall clock.
    pub fn new(client: C) -> Self {
        Self::with_settings(client, &DistributedSettings::default())
    }

    /// Store configured from `settings`. Zero durations are raised to one millisecond.
    pub fn with_settings(client: C, settings: &DistributedSettings) -> Self {
        Self {
            client: Arc::new(client),
            clock: Arc::new(WallClock),
            key_prefix: settings.key_prefix.clone(),
            entry_ttl: Duration::from_millis(settings.entry_ttl_ms.max(1)),
            timeout: Duration::from_millis(settings.timeout_ms.max(1)),
            conflict_retries: settings.conflict_retries,
        }
    }

    /// Override the clock. All instances sharing a store must agree on it.
    pub fn with_clock<K: Clock + 'static>(mut self, clock: K) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Bound each round trip to the store.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.max(Duration::from_millis(1));
        self
    }

    /// Re-attempt up to `retries` times after a lost race before denying.
    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    /// The underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Entry names holding the token count and refill timestamp for `key`.
    pub fn entry_keys(&self, key: &BucketKey) -> [String; 2] {
        let tokens = format!("{}{}", self.key_prefix, key);
        let last_refill = format!("{tokens}{LAST_REFILL_SUFFIX}");
        [tokens, last_refill]
    }

    /// Tokens `key` would have right now, read without a transaction. `0` if the store
    /// cannot be reached.
    pub async fn available_tokens(&self, key: &BucketKey, policy: &RateLimitPolicy) -> u32 {
        let [tokens_key, refill_key] = self.entry_keys(key);
        let read = async {
            let tokens = self.client.get(&tokens_key).await?;
            let last_refill = self.client.get(&refill_key).await?;
            Ok::<_, StoreError>((tokens, last_refill))
        };
        let (tokens, last_refill) = match tokio::time::timeout(self.timeout, read).await {
            Ok(Ok(values)) => values,
            Ok(Err(e)) => {
                tracing::error!(target: "tollgate::distributed", key = %key, error = %e, "failed to read bucket");
                return 0;
            }
            Err(_) => {
                tracing::error!(target: "tollgate::distributed", key = %key, timeout = ?self.timeout, "bucket read timed out");
                return 0;
            }
        };
        let now = self.clock.now_millis();
        let mut state = decode(key.as_str(), policy, tokens.as_deref(), last_refill.as_deref(), now);
        state.refill(policy, now);
        state.tokens()
    }

    async fn run(&self, key: &BucketKey, policy: &RateLimitPolicy, step: Step) -> bool {
        let keys = self.entry_keys(key);
        for attempt in 0..=self.conflict_retries {
            let plan = self.plan(key, policy, step, &keys);
            let outcome = tokio::time::timeout(self.timeout, self.client.transact(&keys, plan)).await;
            match outcome {
                Ok(Ok(TxOutcome::Committed)) => return true,
                Ok(Ok(TxOutcome::Released)) => return false,
                Ok(Ok(TxOutcome::Conflict)) => {
                    tracing::debug!(
                        target: "tollgate::distributed",
                        key = %key,
                        attempt,
                        "bucket modified concurrently; transaction aborted"
                    );
                }
                Ok(Err(e)) => {
                    tracing::error!(target: "tollgate::distributed", key = %key, error = %e, "shared store operation failed");
                    return false;
                }
                Err(_) => {
                    let e = StoreError::Timeout(self.timeout);
                    tracing::error!(target: "tollgate::distributed", key = %key, error = %e, "shared store operation failed");
                    return false;
                }
            }
        }
        false
    }

    fn plan(
        &self,
        key: &BucketKey,
        policy: &RateLimitPolicy,
        step: Step,
        keys: &[String; 2],
    ) -> impl FnOnce(Vec<Option<String>>) -> Option<Vec<Write>> + Send + 'static {
        let bucket = key.as_str().to_string();
        let policy = *policy;
        let clock = self.clock.clone();
        let ttl = self.entry_ttl;
        let [tokens_key, refill_key] = keys.clone();
        move |mut values| {
            let last_refill = values.pop().flatten();
            let tokens = values.pop().flatten();
            let now = clock.now_millis();
            let mut state = decode(&bucket, &policy, tokens.as_deref(), last_refill.as_deref(), now);
            match step {
                Step::Consume => {
                    if !state.try_consume(&policy, now) {
                        return None;
                    }
                }
                Step::TopUp(n) => state.add_tokens(&policy, n, now),
            }
            Some(vec![
                Write { key: tokens_key, value: state.tokens().to_string(), ttl },
                Write { key: refill_key, value: state.last_refill_millis().to_string(), ttl },
            ])
        }
    }
}

// Absent entries mean a fresh bucket; unparseable ones are treated the same way.
fn decode(
    bucket: &str,
    policy: &RateLimitPolicy,
    tokens: Option<&str>,
    last_refill: Option<&str>,
    now_millis: u64,
) -> BucketState {
    let tokens = match tokens {
        None => policy.capacity(),
        Some(raw) => match raw.trim().parse::<i64>() {
            Ok(n) => u32::try_from(n.max(0)).unwrap_or(u32::MAX),
            Err(_) => {
                tracing::warn!(target: "tollgate::distributed", key = %bucket, value = %raw, "invalid token count in shared store");
                policy.capacity()
            }
        },
    };
    let last_refill = match last_refill {
        None => now_millis,
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(millis) => millis,
            Err(_) => {
                tracing::warn!(target: "tollgate::distributed", key = %bucket, value = %raw, "invalid last refill time in shared store");
                now_millis
            }
        },
    };
    BucketState::from_parts(policy, tokens, last_refill)
}

#[async_trait]
impl<C: SharedStore + 'static> BucketStore for DistributedBucketStore<C> {
    async fn try_consume(&self, key: &BucketKey, policy: &RateLimitPolicy) -> bool {
        self.run(key, policy, Step::Consume).await
    }

    async fn add_tokens(&self, key: &BucketKey, tokens: u32, policy: &RateLimitPolicy) {
        if tokens == 0 {
            tracing::debug!(target: "tollgate::distributed", key = %key, "ignoring zero-token top-up");
            return;
        }
        if !self.run(key, policy, Step::TopUp(tokens)).await {
            tracing::debug!(target: "tollgate::distributed", key = %key, tokens, "top-up not applied");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::key::ClientIdentity;
    use crate::store::InMemorySharedStore;
    use crate::test_support::capture_logs;

    const T0: u64 = 1_700_000_000_000;

    fn policy(capacity: u32, refill: u32, period_ms: u64) -> RateLimitPolicy {
        RateLimitPolicy::new(capacity, refill, Duration::from_millis(period_ms)).unwrap()
    }

    fn key(id: &str) -> BucketKey {
        BucketKey::new("orders", &ClientIdentity::ApiKey(id.into()))
    }

    fn setup() -> (ManualClock, InMemorySharedStore, DistributedBucketStore<InMemorySharedStore>) {
        let clock = ManualClock::starting_at(T0);
        let shared = InMemorySharedStore::new().with_clock(clock.clone());
        let store = DistributedBucketStore::new(shared.clone()).with_clock(clock.clone());
        (clock, shared, store)
    }

    #[tokio::test]
    async fn example_burst_then_recovery() {
        let (clock, shared, store) = setup();
        let p = policy(100, 1, 1_000);
        let k = key("abc123");

        let mut admitted = 0;
        for i in 0..150 {
            if store.try_consume(&k, &p).await {
                assert!(i < 100, "call {i} admitted past capacity");
                admitted += 1;
            }
        }
        assert_eq!(admitted, 100);

        clock.advance(Duration::from_secs(5));
        assert!(store.try_consume(&k, &p).await);
        let [tokens_key, refill_key] = store.entry_keys(&k);
        assert_eq!(shared.raw(&tokens_key).as_deref(), Some("4"));
        assert_eq!(shared.raw(&refill_key), Some((T0 + 5_000).to_string()));
    }

    #[tokio::test]
    async fn entries_use_prefix_and_ttl() {
        let (clock, shared, store) = setup();
        let p = policy(3, 1, 1_000);
        let k = key("ttl");
        assert!(store.try_consume(&k, &p).await);

        let [tokens_key, refill_key] = store.entry_keys(&k);
        assert_eq!(tokens_key, "rate_limit:orders:api:ttl");
        assert_eq!(refill_key, "rate_limit:orders:api:ttl:last_refill");
        assert_eq!(shared.raw(&tokens_key).as_deref(), Some("2"));
        assert_eq!(shared.raw(&refill_key), Some(T0.to_string()));

        clock.advance(Duration::from_secs(3_600));
        assert_eq!(shared.raw(&tokens_key), None);
        assert_eq!(shared.raw(&refill_key), None);
    }

    #[tokio::test]
    async fn expired_bucket_behaves_like_first_access() {
        let (clock, _shared, store) = setup();
        // refill far slower than the TTL
        let p = policy(2, 1, 86_400_000);
        let k = key("idle");

        assert!(store.try_consume(&k, &p).await);
        assert!(store.try_consume(&k, &p).await);
        assert!(!store.try_consume(&k, &p).await);

        clock.advance(Duration::from_secs(3_600));
        assert_eq!(store.available_tokens(&k, &p).await, 2);
        assert!(store.try_consume(&k, &p).await);
        assert!(store.try_consume(&k, &p).await);
        assert!(!store.try_consume(&k, &p).await);
    }

    #[tokio::test]
    async fn empty_bucket_releases_without_writing() {
        let (_clock, shared, store) = setup();
        let p = policy(1, 1, 60_000);
        let k = key("empty");
        assert!(store.try_consume(&k, &p).await);
        let before = shared.version_of(&store.entry_keys(&k)[0]);
        assert!(!store.try_consume(&k, &p).await);
        assert_eq!(shared.version_of(&store.entry_keys(&k)[0]), before);
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let (_clock, _shared, store) = setup();
        let p = policy(1, 1, 60_000);
        assert!(store.try_consume(&key("a"), &p).await);
        assert!(!store.try_consume(&key("a"), &p).await);
        assert!(store.try_consume(&key("b"), &p).await);
    }

    #[tokio::test]
    async fn store_failure_denies() {
        let (_clock, shared, store) = setup();
        let p = policy(10, 1, 1_000);
        shared.set_unavailable(true);
        assert!(!store.try_consume(&key("down"), &p).await);
        assert_eq!(store.available_tokens(&key("down"), &p).await, 0);

        shared.set_unavailable(false);
        assert!(store.try_consume(&key("down"), &p).await);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_denies_after_timeout() {
        let (_clock, shared, store) = setup();
        let store = store.with_timeout(Duration::from_millis(50));
        let p = policy(10, 1, 1_000);

        shared.set_latency(Duration::from_secs(2));
        assert!(!store.try_consume(&key("slow"), &p).await);

        shared.set_latency(Duration::ZERO);
        assert!(store.try_consume(&key("slow"), &p).await);
    }

    #[tokio::test]
    async fn lost_race_denies_without_retry() {
        let (_clock, shared, store) = setup();
        let p = policy(10, 1, 1_000);
        let k = key("race");

        shared.conflict_next(1);
        assert!(!store.try_consume(&k, &p).await);
        // the aborted attempt wrote nothing
        assert_eq!(store.available_tokens(&k, &p).await, 10);
        assert!(store.try_consume(&k, &p).await);
    }

    #[tokio::test]
    async fn conflict_retries_are_opt_in_and_bounded() {
        let (_clock, shared, store) = setup();
        let store = store.with_conflict_retries(2);
        let p = policy(10, 1, 1_000);

        shared.conflict_next(2);
        assert!(store.try_consume(&key("retry"), &p).await);

        shared.conflict_next(3);
        assert!(!store.try_consume(&key("retry"), &p).await);
    }

    #[tokio::test]
    async fn add_tokens_tops_up_and_clamps() {
        let (_clock, _shared, store) = setup();
        let p = policy(5, 1, 60_000);
        let k = key("topup");

        for _ in 0..5 {
            assert!(store.try_consume(&k, &p).await);
        }
        assert!(!store.try_consume(&k, &p).await);

        store.add_tokens(&k, 2, &p).await;
        assert_eq!(store.available_tokens(&k, &p).await, 2);
        store.add_tokens(&k, 50, &p).await;
        assert_eq!(store.available_tokens(&k, &p).await, 5);
    }

    #[tokio::test]
    async fn add_tokens_on_failure_is_a_no_op() {
        let (_clock, shared, store) = setup();
        let p = policy(5, 1, 60_000);
        let k = key("topup-down");
        assert!(store.try_consume(&k, &p).await);

        shared.set_unavailable(true);
        store.add_tokens(&k, 1, &p).await;
        shared.set_unavailable(false);
        assert_eq!(store.available_tokens(&k, &p).await, 4);
    }

    #[tokio::test]
    async fn future_refill_timestamp_is_kept() {
        let (_clock, shared, store) = setup();
        let p = policy(5, 1, 1_000);
        let k = key("skew");
        let [tokens_key, refill_key] = store.entry_keys(&k);
        let ahead = (T0 + 10_000).to_string();
        shared.insert_raw(&tokens_key, "3", Duration::from_secs(60));
        shared.insert_raw(&refill_key, &ahead, Duration::from_secs(60));

        assert!(store.try_consume(&k, &p).await);
        assert_eq!(shared.raw(&tokens_key).as_deref(), Some("2"));
        assert_eq!(shared.raw(&refill_key), Some(ahead));
    }

    #[tokio::test]
    async fn malformed_values_fall_back_to_defaults_and_warn() {
        let (logs, _guard) = capture_logs();

        let (_clock, shared, store) = setup();
        let p = policy(5, 1, 1_000);
        let k = key("garbled");
        let [tokens_key, refill_key] = store.entry_keys(&k);
        shared.insert_raw(&tokens_key, "lots", Duration::from_secs(60));
        shared.insert_raw(&refill_key, "yesterday", Duration::from_secs(60));

        assert!(store.try_consume(&k, &p).await);
        assert_eq!(shared.raw(&tokens_key).as_deref(), Some("4"));
        assert_eq!(shared.raw(&refill_key), Some(T0.to_string()));

        let out = logs.contents();
        assert!(out.contains("invalid token count in shared store"), "{out}");
        assert!(out.contains("invalid last refill time in shared store"), "{out}");
        assert!(out.contains("WARN"), "{out}");
    }

    #[tokio::test]
    async fn negative_and_oversized_counts_are_clamped() {
        let (_clock, shared, store) = setup();
        let p = policy(5, 1, 60_000);
        let k = key("clamp");
        let [tokens_key, refill_key] = store.entry_keys(&k);

        shared.insert_raw(&tokens_key, "-3", Duration::from_secs(60));
        shared.insert_raw(&refill_key, &T0.to_string(), Duration::from_secs(60));
        assert!(!store.try_consume(&k, &p).await);

        shared.insert_raw(&tokens_key, "900", Duration::from_secs(60));
        assert!(store.try_consume(&k, &p).await);
        assert_eq!(shared.raw(&tokens_key).as_deref(), Some("4"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn instances_sharing_a_store_never_over_admit() {
        let clock = ManualClock::starting_at(T0);
        let shared = InMemorySharedStore::new().with_clock(clock.clone());
        let p = policy(50, 1, 60_000);
        let k = key("shared");

        let instances: Vec<_> = (0..4)
            .map(|_| {
                Arc::new(
                    DistributedBucketStore::new(shared.clone())
                        .with_clock(clock.clone())
                        .with_conflict_retries(u32::MAX),
                )
            })
            .collect();

        let handles: Vec<_> = (0..200)
            .map(|i| {
                let store = instances[i % instances.len()].clone();
                let k = k.clone();
                tokio::spawn(async move { store.try_consume(&k, &p).await })
            })
            .collect();

        let admitted = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(admitted, 50);
    }
}
