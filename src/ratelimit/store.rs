//! Concurrent key-to-rate mapping shared by both limiter strategies.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::hash::Hash;
use tokio::time::Instant;

use super::purge::{PurgePolicy, Purger};
use super::rate::{QuotaPolicy, Rate};

/// The quota store: committed rates indexed by key.
///
/// Reads never allocate a record. An unseen key reads as a full-quota rate
/// whose window starts at the time of the read.
pub struct QuotaStore<K> {
    records: DashMap<K, Rate>,
    policy: QuotaPolicy,
    purger: Purger,
}

impl<K> fmt::Debug for QuotaStore<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaStore")
            .field("policy", &self.policy)
            .field("purger", &self.purger)
            .finish_non_exhaustive()
    }
}

impl<K> QuotaStore<K>
where
    K: Eq + Hash,
{
    /// Create an empty store.
    pub fn new(policy: QuotaPolicy, purge_policy: PurgePolicy) -> Self {
        Self {
            records: DashMap::new(),
            policy,
            purger: Purger::new(purge_policy),
        }
    }

    /// The quota policy applied to every key.
    pub fn policy(&self) -> QuotaPolicy {
        self.policy
    }

    /// The purge policy applied after commits.
    pub fn purge_policy(&self) -> PurgePolicy {
        self.purger.policy()
    }

    /// The committed record for `key`, if one exists.
    pub fn record(&self, key: &K) -> Option<Rate> {
        self.records.get(key).map(|rate| *rate)
    }

    /// The committed rate for `key`, or the implicit full-quota default.
    pub fn get(&self, key: &K) -> Rate {
        self.record(key)
            .unwrap_or_else(|| self.policy.fresh(Instant::now()))
    }

    /// Whether `key` has quota left in its current window.
    pub fn allow(&self, key: &K) -> bool {
        self.remaining(key) > 0
    }

    /// Operations left for `key` right now, counting an expired window as full.
    pub fn remaining(&self, key: &K) -> u64 {
        self.policy
            .effective(self.record(key), Instant::now())
            .remaining_requests
    }

    /// When the quota for `key` next resets.
    pub fn resets_at(&self, key: &K) -> Instant {
        match self.record(key) {
            Some(rate) => rate.resets_at,
            None => Instant::now() + self.policy.window(),
        }
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Replace the record for `key` with `next` only if it still equals `expected`.
    ///
    /// `expected == None` means the key must still be absent. Returns whether
    /// the commit happened; the shard lock is released before returning.
    pub fn compare_and_commit(&self, key: &K, expected: Option<Rate>, next: Rate) -> bool
    where
        K: Clone,
    {
        match self.records.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if expected == Some(*entry.get()) {
                    entry.insert(next);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                if expected.is_none() {
                    entry.insert(next);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Unconditionally commit `next` for `key`. Only safe for a sole writer.
    pub fn commit(&self, key: K, next: Rate) {
        self.records.insert(key, next);
    }

    /// Run a purge if the store is large and the purge interval has passed.
    pub fn purge_if_due(&self, now: Instant) -> Option<usize> {
        self.purger.maybe_purge(&self.records, now)
    }
}
