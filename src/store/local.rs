use super::BucketStore;
use crate::bucket::BucketState;
use crate::clock::{Clock, MonotonicClock};
use crate::key::BucketKey;
use crate::policy::RateLimitPolicy;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};
use std::time::Duration;

type Slots = HashMap<BucketKey, Arc<Mutex<Slot>>>;

#[derive(Debug, Default)]
struct Slot {
    // None until first use, and again once idle past the TTL
    state: Option<BucketState>,
    touched_millis: u64,
}

impl Slot {
    fn is_idle(&self, now_millis: u64, idle_ttl: Option<Duration>) -> bool {
        match idle_ttl {
            Some(ttl) => {
                let ttl = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
                now_millis.saturating_sub(self.touched_millis) >= ttl
            }
            None => false,
        }
    }

    fn current(&self, policy: &RateLimitPolicy, now_millis: u64, idle_ttl: Option<Duration>) -> BucketState {
        match self.state {
            Some(state) if !self.is_idle(now_millis, idle_ttl) => {
                BucketState::from_parts(policy, state.tokens(), state.last_refill_millis())
            }
            _ => BucketState::full(policy, now_millis),
        }
    }
}

/// In-process bucket store.
///
/// The map lock is only held to find or insert a key's slot; each slot has its own
/// mutex, so a burst on one key never stalls requests for another. State is lost when
/// the process exits and every key starts over fully charged.
///
/// With an idle TTL, inserting a new key sweeps out idle slots at most once per TTL, so
/// the map holds roughly the keys seen within the last two TTLs. Sweeps never wait on a
/// slot's mutex: a slot that is locked is in use and stays.
#[derive(Debug)]
pub struct LocalBucketStore {
    slots: RwLock<Slots>,
    clock: Arc<dyn Clock>,
    idle_ttl: Option<Duration>,
    next_sweep_millis: AtomicU64,
}

impl Default for LocalBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBucketStore {
    /// Store on a monotonic clock, keeping every key forever.
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            clock: Arc::new(MonotonicClock::default()),
            idle_ttl: None,
            next_sweep_millis: AtomicU64::new(0),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Forget keys untouched for `ttl`. A forgotten key comes back fully charged.
    ///
    /// Idle keys are reclaimed as new keys arrive; [`purge_idle`](Self::purge_idle)
    /// reclaims them on demand.
    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = Some(ttl);
        self
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no key is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tokens `key` would have right now, without consuming or storing anything.
    pub fn available_tokens(&self, key: &BucketKey, policy: &RateLimitPolicy) -> u32 {
        let now = self.clock.now_millis();
        let slot = self.slots.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned();
        let mut state = match slot {
            Some(slot) => lock(&slot).current(policy, now, self.idle_ttl),
            None => BucketState::full(policy, now),
        };
        state.refill(policy, now);
        state.tokens()
    }

    /// Drop every slot idle for longer than the configured TTL. Returns how many went.
    /// Without a TTL nothing is dropped.
    pub fn purge_idle(&self) -> usize {
        if self.idle_ttl.is_none() {
            return 0;
        }
        let now = self.clock.now_millis();
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        self.sweep(&mut slots, now)
    }

    fn sweep(&self, slots: &mut Slots, now_millis: u64) -> usize {
        let before = slots.len();
        slots.retain(|_, slot| match slot.try_lock() {
            Ok(slot) => !slot.is_idle(now_millis, self.idle_ttl),
            Err(TryLockError::Poisoned(poisoned)) => !poisoned.into_inner().is_idle(now_millis, self.idle_ttl),
            Err(TryLockError::WouldBlock) => true,
        });
        let purged = before - slots.len();
        if purged > 0 {
            tracing::debug!(target: "tollgate::local", purged, remaining = slots.len(), "purged idle buckets");
        }
        purged
    }

    fn sweep_due(&self, now_millis: u64) -> bool {
        let Some(ttl) = self.idle_ttl else {
            return false;
        };
        if now_millis < self.next_sweep_millis.load(Ordering::Relaxed) {
            return false;
        }
        let ttl = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.next_sweep_millis.store(now_millis.saturating_add(ttl), Ordering::Relaxed);
        true
    }

    fn slot(&self, key: &BucketKey) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.slots.read().unwrap_or_else(PoisonError::into_inner).get(key) {
            return slot.clone();
        }
        let now = self.clock.now_millis();
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if !slots.contains_key(key) && self.sweep_due(now) {
            self.sweep(&mut slots, now);
        }
        // touched now, so a concurrent sweep cannot take it before first use
        slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Slot { state: None, touched_millis: now })))
            .clone()
    }

    fn with_state<R>(
        &self,
        key: &BucketKey,
        policy: &RateLimitPolicy,
        op: impl FnOnce(&mut BucketState, u64) -> R,
    ) -> R {
        let slot = self.slot(key);
        let mut slot = lock(&slot);
        let now = self.clock.now_millis();
        let mut state = slot.current(policy, now, self.idle_ttl);
        let out = op(&mut state, now);
        slot.state = Some(state);
        slot.touched_millis = now;
        out
    }
}

// Every write leaves a clamped, valid state behind, so a poisoned slot is still usable.
fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl BucketStore for LocalBucketStore {
    async fn try_consume(&self, key: &BucketKey, policy: &RateLimitPolicy) -> bool {
        self.with_state(key, policy, |state, now| state.try_consume(policy, now))
    }

    async fn add_tokens(&self, key: &BucketKey, tokens: u32, policy: &RateLimitPolicy) {
        if tokens == 0 {
            tracing::debug!(target: "tollgate::local", key = %key, "ignoring zero-token top-up");
            return;
        }
        self.with_state(key, policy, |state, now| state.add_tokens(policy, tokens, now));
    }
}
