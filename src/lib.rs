//! Turnstile - Per-key Request Quotas
//!
//! This crate enforces a request quota per caller key on a rolling window:
//! each key may perform at most N operations within a window of duration D,
//! after which its quota resets on the next access. Updates are lock-free
//! compare-and-commit retries, or alternatively funneled through a single
//! writer task. An axum middleware applies the quota to HTTP requests.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
