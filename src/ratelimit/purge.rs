//! Amortized eviction of expired rate records.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::rate::Rate;

/// Store size above which purging is considered.
pub const DEFAULT_PURGE_THRESHOLD: usize = 100;
/// Minimum time between two purges.
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(20 * 60);

/// When a purge is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgePolicy {
    /// Number of records the store must exceed
    pub threshold: usize,
    /// Time that must have passed since the previous purge
    pub interval: Duration,
}

impl Default for PurgePolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_PURGE_THRESHOLD,
            interval: DEFAULT_PURGE_INTERVAL,
        }
    }
}

/// Removes expired records from a quota store.
///
/// Purging is triggered by writers after a successful commit, never by a
/// timer. Only records that are already expired are removed, so a purge can
/// race with writers on other keys without losing state.
#[derive(Debug)]
pub struct Purger {
    policy: PurgePolicy,
    last_purge: Mutex<Instant>,
}

impl Purger {
    /// Create a purger whose interval starts counting now.
    pub fn new(policy: PurgePolicy) -> Self {
        Self {
            policy,
            last_purge: Mutex::new(Instant::now()),
        }
    }

    /// The policy this purger enforces.
    pub fn policy(&self) -> PurgePolicy {
        self.policy
    }

    /// Purge expired records if the store is large and the interval has passed.
    ///
    /// Returns the number of removed records when a purge ran. The caller must
    /// not hold a reference into `records`.
    pub fn maybe_purge<K>(&self, records: &DashMap<K, Rate>, now: Instant) -> Option<usize>
    where
        K: Eq + Hash,
    {
        if records.len() <= self.policy.threshold {
            return None;
        }

        // Another caller is already purging.
        let mut last_purge = self.last_purge.try_lock()?;
        if now.saturating_duration_since(*last_purge) <= self.policy.interval {
            return None;
        }
        *last_purge = now;

        let mut removed = 0;
        records.retain(|_, rate| {
            let keep = !rate.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            info!(removed, remaining = records.len(), "Purged expired rate records");
        } else {
            debug!(records = records.len(), "Purge found no expired rate records");
        }

        Some(removed)
    }
}
