//! Quota metadata attached to HTTP responses.

use axum::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::ratelimit::{Admission, Rate};

/// Configured quota ceiling.
pub const HEADER_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Operations left in the current window.
pub const HEADER_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Unix epoch second at which the quota resets.
pub const HEADER_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// The four pieces of quota information exposed on a limited request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaHeaders {
    /// Configured limit per window
    pub limit: u64,
    /// Remaining operations after this request
    pub remaining: u64,
    /// Absolute reset time in seconds since the Unix epoch
    pub reset_epoch_secs: i64,
    /// Seconds to wait before retrying, present only on rejection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl QuotaHeaders {
    /// Build the headers for an admission decision made just now.
    pub fn for_admission(limit: u64, admission: &Admission) -> Self {
        Self::at(limit, admission, Instant::now(), Utc::now())
    }

    /// Build the headers for an admission given the monotonic and wall clock readings.
    pub fn at(limit: u64, admission: &Admission, now: Instant, wall_now: DateTime<Utc>) -> Self {
        let rate: Rate = admission.rate();
        let until_reset = rate.duration_until_reset(now);
        let reset_at = wall_now
            + chrono::Duration::from_std(until_reset).unwrap_or_else(|_| chrono::Duration::zero());

        let retry_after_secs = match admission {
            Admission::Allowed(_) => None,
            Admission::Rejected(_) => {
                let whole = until_reset.as_secs();
                Some(if until_reset.subsec_nanos() > 0 { whole + 1 } else { whole })
            }
        };

        Self {
            limit,
            remaining: rate.remaining_requests,
            reset_epoch_secs: reset_at.timestamp(),
            retry_after_secs,
        }
    }

    /// Write the headers into a response header map.
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(HEADER_LIMIT, HeaderValue::from(self.limit));
        headers.insert(HEADER_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(HEADER_RESET, HeaderValue::from(self.reset_epoch_secs));
        if let Some(retry_after) = self.retry_after_secs {
            headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
        }
    }
}
