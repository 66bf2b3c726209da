//! Quota backend trait for abstracting the two update strategies.

use async_trait::async_trait;
use tokio::time::Instant;

use super::rate::{Admission, QuotaPolicy, Rate};
use crate::error::Result;

/// Trait for quota limiter implementations.
///
/// This trait abstracts over the compare-and-commit `RateLimiter` and the
/// single-writer `SerializedRateLimiter` so the HTTP layer can work with
/// either. Reads are synchronous for both; mutations may suspend.
#[async_trait]
pub trait QuotaBackend<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// The quota policy applied to every key.
    fn policy(&self) -> QuotaPolicy;

    /// Whether `key` may perform an operation right now.
    fn allow(&self, key: &K) -> bool;

    /// The committed rate for `key`, or a full-quota rate if none exists.
    fn get(&self, key: &K) -> Rate;

    /// When the quota for `key` next resets.
    fn resets_at(&self, key: &K) -> Instant;

    /// Consume one operation for `key` unconditionally.
    async fn consume(&self, key: K) -> Result<Rate>;

    /// Atomically check for remaining quota and consume it if present.
    async fn try_consume(&self, key: K) -> Result<Admission>;
}
