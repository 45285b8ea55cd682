//! Token-bucket arithmetic.
//!
//! Pure functions over a [`BucketState`]: no I/O, no clocks. Callers pass `now` in
//! milliseconds from whatever [`Clock`](crate::clock::Clock) their store uses.
//!
//! Refill only ever advances `last_refill_millis` by whole periods, so the fraction of
//! a period that has already elapsed is carried into the next call instead of being
//! dropped.

use crate::policy::RateLimitPolicy;

/// Tokens and refill bookkeeping for one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    tokens: u32,
    last_refill_millis: u64,
}

impl BucketState {
    /// A bucket seen for the first time: fully charged, refilled just now.
    pub fn full(policy: &RateLimitPolicy, now_millis: u64) -> Self {
        Self { tokens: policy.capacity(), last_refill_millis: now_millis }
    }

    /// Rebuild state from stored parts, clamping tokens to the policy's capacity.
    pub fn from_parts(policy: &RateLimitPolicy, tokens: u32, last_refill_millis: u64) -> Self {
        Self { tokens: tokens.min(policy.capacity()), last_refill_millis }
    }

    /// Tokens currently in the bucket.
    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    /// Start of the refill period currently in progress.
    pub fn last_refill_millis(&self) -> u64 {
        self.last_refill_millis
    }

    /// Credit every whole period elapsed since the last refill.
    ///
    /// A `last_refill_millis` in the future (clock skew between instances) counts as no
    /// time elapsed; the timestamp is left where it is.
    pub fn refill(&mut self, policy: &RateLimitPolicy, now_millis: u64) {
        let capacity = policy.capacity();
        self.tokens = self.tokens.min(capacity);

        let period = policy.refill_period_millis();
        let elapsed = now_millis.saturating_sub(self.last_refill_millis);
        if elapsed < period {
            return;
        }

        let periods = elapsed / period;
        let added = periods.saturating_mul(u64::from(policy.refill_tokens()));
        let refilled = u64::from(self.tokens).saturating_add(added).min(u64::from(capacity));
        // refilled <= capacity, which is a u32
        self.tokens = u32::try_from(refilled).unwrap_or(capacity);
        self.last_refill_millis = self.last_refill_millis.saturating_add(periods * period);
    }

    /// Refill, then take one token if any is left.
    pub fn try_consume(&mut self, policy: &RateLimitPolicy, now_millis: u64) -> bool {
        self.refill(policy, now_millis);
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Refill, then credit `tokens`, never exceeding capacity.
    pub fn add_tokens(&mut self, policy: &RateLimitPolicy, tokens: u32, now_millis: u64) {
        self.refill(policy, now_millis);
        self.tokens = self.tokens.saturating_add(tokens).min(policy.capacity());
    }
}
