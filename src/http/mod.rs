//! HTTP integration: axum middleware, request policies and server.

mod headers;
mod middleware;
mod policy;
mod server;

pub use headers::{QuotaHeaders, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET};
pub use middleware::rate_limit_middleware;
pub use policy::{
    exclude_preflight_and_health_checks, exclude_preflight_and_suffixes,
    header_or_remote_origin, remote_origin, too_many_requests, KeyExtractor, PathExclusion,
    RateLimiting, RateLimitingBuilder, RejectionHandler,
};
pub use server::{default_routes, HttpServer};

use axum::Router;
use std::sync::Arc;

/// Wrap every route of `router` in the rate limiting middleware.
pub fn rate_limited(router: Router, rate_limiting: Arc<RateLimiting>) -> Router {
    router.layer(axum::middleware::from_fn_with_state(
        rate_limiting,
        rate_limit_middleware,
    ))
}
