//! Per-key quota tracking and state management.

mod backend;
mod limiter;
mod purge;
mod rate;
mod serialized;
mod store;

pub use backend::QuotaBackend;
pub use limiter::RateLimiter;
pub use purge::{PurgePolicy, Purger, DEFAULT_PURGE_INTERVAL, DEFAULT_PURGE_THRESHOLD};
pub use rate::{Admission, QuotaPolicy, Rate, DEFAULT_LIMIT, DEFAULT_WINDOW};
pub use serialized::{SerializedRateLimiter, DEFAULT_QUEUE_CAPACITY};
pub use store::QuotaStore;
