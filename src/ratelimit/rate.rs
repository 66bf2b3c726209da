//! Rate records and the fixed-window reset policy.

use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Result, TurnstileError};

/// Default number of operations permitted per window.
pub const DEFAULT_LIMIT: u64 = 1000;
/// Default window duration.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3600);

/// The state of one key's current window.
///
/// A `Rate` is an immutable value. Every update produces a new `Rate` that
/// replaces the previous one in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate {
    /// When the current window ends
    pub resets_at: Instant,
    /// Operations still permitted in the current window
    pub remaining_requests: u64,
}

impl Rate {
    /// Create a new rate.
    pub fn new(resets_at: Instant, remaining_requests: u64) -> Self {
        Self {
            resets_at,
            remaining_requests,
        }
    }

    /// Whether no operations remain in this window.
    pub fn is_depleted(&self) -> bool {
        self.remaining_requests == 0
    }

    /// Whether the window has ended at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.resets_at
    }

    /// Return a rate with one fewer remaining request, clamped at zero.
    pub fn consume(self) -> Self {
        Self {
            remaining_requests: self.remaining_requests.saturating_sub(1),
            ..self
        }
    }

    /// Time left until the window resets, zero if it already has.
    pub fn duration_until_reset(&self, now: Instant) -> Duration {
        self.resets_at.saturating_duration_since(now)
    }
}

/// Outcome of an atomic check-and-decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The operation may proceed; carries the committed rate.
    Allowed(Rate),
    /// The quota is exhausted; carries the unchanged committed rate.
    Rejected(Rate),
}

impl Admission {
    /// Whether the operation was admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed(_))
    }

    /// The rate observed by this decision.
    pub fn rate(&self) -> Rate {
        match self {
            Admission::Allowed(rate) | Admission::Rejected(rate) => *rate,
        }
    }
}

/// Quota ceiling and window length shared by every key of a limiter.
///
/// Windows restart on access: a record that is observed expired is replaced
/// with a full-quota rate whose window starts at that instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    limit: u64,
    window: Duration,
}

impl QuotaPolicy {
    /// Create a policy, rejecting a zero limit or an empty window.
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(TurnstileError::Config(
                "limit must be greater than zero".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(TurnstileError::Config(
                "window duration must be greater than zero".to_string(),
            ));
        }
        Ok(Self { limit, window })
    }

    /// Maximum operations per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// A full-quota rate whose window starts at `now`.
    pub fn fresh(&self, now: Instant) -> Rate {
        Rate::new(now + self.window, self.limit)
    }

    /// The rate in effect at `now` given the committed record, if any.
    pub fn effective(&self, record: Option<Rate>, now: Instant) -> Rate {
        match record {
            Some(rate) if !rate.is_expired(now) => rate,
            _ => self.fresh(now),
        }
    }

    /// The rate to commit for an unconditional consume.
    pub fn next(&self, record: Option<Rate>, now: Instant) -> Rate {
        self.effective(record, now).consume()
    }

    /// Decide whether an operation is admitted and compute the rate to commit.
    pub fn admit(&self, record: Option<Rate>, now: Instant) -> Admission {
        let current = self.effective(record, now);
        if current.is_depleted() {
            Admission::Rejected(current)
        } else {
            Admission::Allowed(current.consume())
        }
    }
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            window: DEFAULT_WINDOW,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_decrements() {
        let now = Instant::now();
        let rate = Rate::new(now, 3).consume();
        assert_eq!(rate.remaining_requests, 2);
        assert_eq!(rate.resets_at, now);
    }

    #[test]
    fn test_consume_clamps_at_zero() {
        let rate = Rate::new(Instant::now(), 0);
        assert!(rate.is_depleted());
        assert_eq!(rate.consume().remaining_requests, 0);
    }

    #[test]
    fn test_is_expired_at_boundary() {
        let now = Instant::now();
        let rate = Rate::new(now + Duration::from_secs(5), 1);
        assert!(!rate.is_expired(now));
        assert!(rate.is_expired(now + Duration::from_secs(5)));
        assert!(rate.is_expired(now + Duration::from_secs(6)));
    }

    #[test]
    fn test_policy_rejects_zero_limit() {
        let result = QuotaPolicy::new(0, Duration::from_secs(1));
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_policy_rejects_zero_window() {
        let result = QuotaPolicy::new(10, Duration::ZERO);
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_effective_replaces_expired_record() {
        let policy = QuotaPolicy::new(5, Duration::from_secs(20)).unwrap();
        let now = Instant::now();
        let stale = Rate::new(now, 0);

        let rate = policy.effective(Some(stale), now);
        assert_eq!(rate.remaining_requests, 5);
        assert_eq!(rate.resets_at, now + Duration::from_secs(20));
    }

    #[test]
    fn test_admit_rejects_depleted_window() {
        let policy = QuotaPolicy::new(5, Duration::from_secs(20)).unwrap();
        let now = Instant::now();
        let depleted = Rate::new(now + Duration::from_secs(1), 0);

        assert_eq!(
            policy.admit(Some(depleted), now),
            Admission::Rejected(depleted)
        );
    }

    #[test]
    fn test_admit_consumes_from_fresh_window() {
        let policy = QuotaPolicy::new(5, Duration::from_secs(20)).unwrap();
        let now = Instant::now();

        let admission = policy.admit(None, now);
        assert!(admission.is_allowed());
        assert_eq!(admission.rate().remaining_requests, 4);
    }
}
