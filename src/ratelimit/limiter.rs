//! Core rate limiter implementation.

use async_trait::async_trait;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::backend::QuotaBackend;
use super::purge::PurgePolicy;
use super::rate::{Admission, QuotaPolicy, Rate};
use super::store::QuotaStore;
use crate::error::Result;

/// Per-key quota limiter using lock-free compare-and-commit updates.
///
/// This struct is thread-safe and can be shared across multiple tasks.
/// Every mutation reads the committed rate for a key, computes the next
/// rate and commits it only if no other writer got there first; otherwise
/// it retries from a fresh read until it succeeds.
#[derive(Debug)]
pub struct RateLimiter<K> {
    store: QuotaStore<K>,
}

impl<K> RateLimiter<K>
where
    K: Eq + Hash + Clone + Debug,
{
    /// Create a limiter allowing `limit` operations per `window` for each key.
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        Ok(Self::with_policy(QuotaPolicy::new(limit, window)?))
    }

    /// Create a limiter from an already validated policy.
    pub fn with_policy(policy: QuotaPolicy) -> Self {
        Self::with_policies(policy, PurgePolicy::default())
    }

    /// Create a limiter with explicit quota and purge policies.
    pub fn with_policies(policy: QuotaPolicy, purge_policy: PurgePolicy) -> Self {
        Self {
            store: QuotaStore::new(policy, purge_policy),
        }
    }

    /// Whether `key` may perform an operation right now. Never mutates.
    pub fn allow(&self, key: &K) -> bool {
        self.store.allow(key)
    }

    /// Consume one operation for `key` and return the committed rate.
    ///
    /// An expired window is restarted before the decrement. Consuming from a
    /// depleted window leaves the remaining count at zero.
    pub fn consume(&self, key: &K) -> Rate {
        let policy = self.store.policy();
        self.commit_with(key, |record, now| {
            Admission::Allowed(policy.next(record, now))
        })
        .rate()
    }

    /// Atomically check for remaining quota and, if there is any, consume it.
    ///
    /// A rejection never mutates the store.
    pub fn try_consume(&self, key: &K) -> Admission {
        let policy = self.store.policy();
        self.commit_with(key, |record, now| policy.admit(record, now))
    }

    /// Consume for `key` and invoke exactly one of the two callbacks.
    ///
    /// `on_allow` receives the committed rate. `on_reject` receives the
    /// unchanged committed rate and runs without any mutation.
    pub fn consume_with<T>(
        &self,
        key: &K,
        on_reject: impl FnOnce(Rate) -> T,
        on_allow: impl FnOnce(Rate) -> T,
    ) -> T {
        match self.try_consume(key) {
            Admission::Allowed(rate) => on_allow(rate),
            Admission::Rejected(rate) => on_reject(rate),
        }
    }

    /// Run `on_allow` if `key` has quota left, without consuming any.
    pub fn if_allowed<T>(&self, key: &K, on_allow: impl FnOnce() -> T) -> Option<T> {
        if self.allow(key) {
            Some(on_allow())
        } else {
            None
        }
    }

    /// The committed rate for `key`, or a full-quota rate if none exists.
    pub fn get(&self, key: &K) -> Rate {
        self.store.get(key)
    }

    /// Operations left for `key` right now.
    pub fn remaining(&self, key: &K) -> u64 {
        self.store.remaining(key)
    }

    /// When the quota for `key` next resets.
    pub fn resets_at(&self, key: &K) -> Instant {
        self.store.resets_at(key)
    }

    /// The configured quota policy.
    pub fn policy(&self) -> QuotaPolicy {
        self.store.policy()
    }

    /// Maximum operations per window.
    pub fn limit(&self) -> u64 {
        self.store.policy().limit()
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.store.policy().window()
    }

    /// Get the number of stored rate records.
    pub fn record_count(&self) -> usize {
        self.store.len()
    }

    /// Compare-and-commit loop shared by all mutating operations.
    ///
    /// `decide` maps the observed record to an admission; only allowed
    /// admissions are committed. The loop never gives up on a conflict.
    fn commit_with<F>(&self, key: &K, decide: F) -> Admission
    where
        F: Fn(Option<Rate>, Instant) -> Admission,
    {
        loop {
            let now = Instant::now();
            let observed = self.store.record(key);

            let next = match decide(observed, now) {
                Admission::Allowed(next) => next,
                rejected @ Admission::Rejected(_) => {
                    debug!(key = ?key, "Rate limit exceeded");
                    return rejected;
                }
            };

            if self.store.compare_and_commit(key, observed, next) {
                match observed {
                    None => debug!(key = ?key, "Created rate record"),
                    Some(previous) if previous.is_expired(now) => {
                        debug!(key = ?key, "Window expired, quota reset")
                    }
                    Some(_) => {}
                }
                trace!(
                    key = ?key,
                    remaining = next.remaining_requests,
                    "Committed rate"
                );

                self.store.purge_if_due(now);
                return Admission::Allowed(next);
            }

            trace!(key = ?key, "Concurrent update on rate record, retrying");
        }
    }
}

impl<K> Default for RateLimiter<K>
where
    K: Eq + Hash + Clone + Debug,
{
    fn default() -> Self {
        Self::with_policy(QuotaPolicy::default())
    }
}

#[async_trait]
impl<K> QuotaBackend<K> for RateLimiter<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    fn policy(&self) -> QuotaPolicy {
        RateLimiter::policy(self)
    }

    fn allow(&self, key: &K) -> bool {
        RateLimiter::allow(self, key)
    }

    fn get(&self, key: &K) -> Rate {
        RateLimiter::get(self, key)
    }

    fn resets_at(&self, key: &K) -> Instant {
        RateLimiter::resets_at(self, key)
    }

    async fn consume(&self, key: K) -> Result<Rate> {
        Ok(RateLimiter::consume(self, &key))
    }

    async fn try_consume(&self, key: K) -> Result<Admission> {
        Ok(RateLimiter::try_consume(self, &key))
    }
}
