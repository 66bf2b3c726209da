//! Single-writer rate limiter.
//!
//! All mutations for all keys are funneled through one bounded queue and
//! applied by a dedicated worker task, in arrival order. Since the worker is
//! the only writer it commits without compare-and-retry. Readers go straight
//! to the shared store and see the latest committed value.

use async_trait::async_trait;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::backend::QuotaBackend;
use super::purge::PurgePolicy;
use super::rate::{Admission, QuotaPolicy, Rate};
use super::store::QuotaStore;
use crate::error::{Result, TurnstileError};

/// Default capacity of the update queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// The kind of mutation a caller requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateKind {
    /// Decrement unconditionally (clamped at zero)
    Consume,
    /// Decrement only if quota remains
    TryConsume,
}

/// A queued mutation and the channel its outcome is reported on.
struct UpdateRequest<K> {
    key: K,
    kind: UpdateKind,
    reply: oneshot::Sender<Admission>,
}

/// Per-key quota limiter that serializes all updates through one worker.
///
/// When the queue is full, mutating calls suspend until space frees up.
/// A call cancelled while waiting for queue space has no effect on the
/// store. A call cancelled after its request was queued still has its
/// update applied; only the reply is discarded.
pub struct SerializedRateLimiter<K> {
    store: Arc<QuotaStore<K>>,
    sender: mpsc::Sender<UpdateRequest<K>>,
}

impl<K> SerializedRateLimiter<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Create a limiter and spawn its worker on the current Tokio runtime.
    pub fn new(limit: u64, window: Duration, queue_capacity: usize) -> Result<Self> {
        Self::spawn(
            QuotaPolicy::new(limit, window)?,
            PurgePolicy::default(),
            queue_capacity,
        )
    }

    /// Create a limiter from explicit policies and spawn its worker.
    ///
    /// Fails outside a Tokio runtime, since there is nowhere to run the worker.
    pub fn spawn(
        policy: QuotaPolicy,
        purge_policy: PurgePolicy,
        queue_capacity: usize,
    ) -> Result<Self> {
        if queue_capacity == 0 {
            return Err(TurnstileError::Config(
                "update queue capacity must be greater than zero".to_string(),
            ));
        }
        let runtime = Handle::try_current().map_err(|e| {
            TurnstileError::Config(format!("serialized rate limiter needs a Tokio runtime: {e}"))
        })?;

        let store = Arc::new(QuotaStore::new(policy, purge_policy));
        let (sender, receiver) = mpsc::channel(queue_capacity);

        let worker = UpdateWorker {
            store: store.clone(),
            receiver,
        };
        runtime.spawn(worker.run());

        info!(
            limit = policy.limit(),
            window_secs = policy.window().as_secs(),
            queue_capacity,
            "Serialized rate limiter started"
        );

        Ok(Self { store, sender })
    }

    /// Whether `key` may perform an operation right now. Never mutates.
    pub fn allow(&self, key: &K) -> bool {
        self.store.allow(key)
    }

    /// Consume one operation for `key` and return the committed rate.
    pub async fn consume(&self, key: K) -> Result<Rate> {
        Ok(self.submit(key, UpdateKind::Consume).await?.rate())
    }

    /// Atomically check for remaining quota and, if there is any, consume it.
    pub async fn try_consume(&self, key: K) -> Result<Admission> {
        self.submit(key, UpdateKind::TryConsume).await
    }

    /// Consume for `key` and invoke exactly one of the two callbacks.
    pub async fn consume_with<T>(
        &self,
        key: K,
        on_reject: impl FnOnce(Rate) -> T,
        on_allow: impl FnOnce(Rate) -> T,
    ) -> Result<T> {
        Ok(match self.try_consume(key).await? {
            Admission::Allowed(rate) => on_allow(rate),
            Admission::Rejected(rate) => on_reject(rate),
        })
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

    /// Get the number of stored rate records.
    pub fn record_count(&self) -> usize {
        self.store.len()
    }

    async fn submit(&self, key: K, kind: UpdateKind) -> Result<Admission> {
        let (reply, outcome) = oneshot::channel();

        self.sender
            .send(UpdateRequest { key, kind, reply })
            .await
            .map_err(|_| TurnstileError::WorkerUnavailable)?;

        outcome.await.map_err(|_| TurnstileError::WorkerUnavailable)
    }
}

/// The sole writer of a serialized limiter's store.
struct UpdateWorker<K> {
    store: Arc<QuotaStore<K>>,
    receiver: mpsc::Receiver<UpdateRequest<K>>,
}

impl<K> UpdateWorker<K>
where
    K: Eq + Hash + Clone + Debug,
{
    async fn run(mut self) {
        debug!("Quota update worker running");

        while let Some(request) = self.receiver.recv().await {
            let admission = self.apply(request.key, request.kind);
            // The caller may have gone away; its update stands regardless.
            let _ = request.reply.send(admission);
        }

        debug!("Quota update worker stopped");
    }

    fn apply(&self, key: K, kind: UpdateKind) -> Admission {
        let policy = self.store.policy();
        let now = Instant::now();
        let observed = self.store.record(&key);

        let admission = match kind {
            UpdateKind::Consume => Admission::Allowed(policy.next(observed, now)),
            UpdateKind::TryConsume => policy.admit(observed, now),
        };

        match admission {
            Admission::Allowed(next) => {
                trace!(
                    key = ?key,
                    remaining = next.remaining_requests,
                    "Committed rate"
                );
                self.store.commit(key, next);
                self.store.purge_if_due(now);
            }
            Admission::Rejected(_) => debug!(key = ?key, "Rate limit exceeded"),
        }

        admission
    }
}

#[async_trait]
impl<K> QuotaBackend<K> for SerializedRateLimiter<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    fn policy(&self) -> QuotaPolicy {
        SerializedRateLimiter::policy(self)
    }

    fn allow(&self, key: &K) -> bool {
        SerializedRateLimiter::allow(self, key)
    }

    fn get(&self, key: &K) -> Rate {
        SerializedRateLimiter::get(self, key)
    }

    fn resets_at(&self, key: &K) -> Instant {
        SerializedRateLimiter::resets_at(self, key)
    }

    async fn consume(&self, key: K) -> Result<Rate> {
        SerializedRateLimiter::consume(self, key).await
    }

    async fn try_consume(&self, key: K) -> Result<Admission> {
        SerializedRateLimiter::try_consume(self, key).await
    }
}
