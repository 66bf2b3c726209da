//! Rate limiting middleware for axum routers.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

use super::headers::QuotaHeaders;
use super::policy::RateLimiting;
use crate::config::HookOrder;
use crate::ratelimit::Admission;

/// Enforce the per-key quota on every non-excluded request.
///
/// Install with `axum::middleware::from_fn_with_state`. Excluded requests
/// pass through untouched. Every other response carries the quota headers;
/// rejected requests are answered by the configured rejection handler.
#[instrument(
    skip_all,
    fields(method = %request.method(), path = %request.uri().path())
)]
pub async fn rate_limit_middleware(
    State(rate_limiting): State<Arc<RateLimiting>>,
    request: Request,
    next: Next,
) -> Response {
    if rate_limiting.is_excluded(request.method(), request.uri().path()) {
        trace!("Request excluded from rate limiting");
        return next.run(request).await;
    }

    let key = rate_limiting.key_for(&request);

    match rate_limiting.hook_order() {
        HookOrder::Before => match rate_limiting.admit(key.clone()).await {
            Some(admission @ Admission::Allowed(_)) => {
                let response = next.run(request).await;
                decorate(&rate_limiting, &admission, response)
            }
            Some(admission @ Admission::Rejected(_)) => reject(&rate_limiting, &key, &admission),
            None => next.run(request).await,
        },
        HookOrder::After => {
            let response = next.run(request).await;
            match rate_limiting.admit(key.clone()).await {
                Some(admission @ Admission::Allowed(_)) => {
                    decorate(&rate_limiting, &admission, response)
                }
                Some(admission @ Admission::Rejected(_)) => {
                    reject(&rate_limiting, &key, &admission)
                }
                None => response,
            }
        }
    }
}

fn decorate(
    rate_limiting: &RateLimiting,
    admission: &Admission,
    mut response: Response,
) -> Response {
    let headers = QuotaHeaders::for_admission(rate_limiting.limit(), admission);
    debug!(remaining = headers.remaining, "Request admitted");
    headers.apply(response.headers_mut());
    response
}

fn reject(rate_limiting: &RateLimiting, key: &str, admission: &Admission) -> Response {
    let headers = QuotaHeaders::for_admission(rate_limiting.limit(), admission);
    warn!(
        key = %key,
        retry_after = headers.retry_after_secs.unwrap_or_default(),
        "Rate limit exceeded"
    );

    let mut response = rate_limiting.reject(&headers);
    headers.apply(response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::headers::{HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET};
    use crate::http::policy::header_or_remote_origin;
    use crate::http::rate_limited;
    use crate::ratelimit::{QuotaBackend, RateLimiter, SerializedRateLimiter};
    use axum::body::Body;
    use axum::http::header::RETRY_AFTER;
    use axum::http::{Method, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    fn routes() -> Router {
        Router::new()
            .route("/", get(|| async { "Rate limited" }).options(|| async { "" }))
            .route("/healthz", get(|| async { "ok" }))
    }

    fn app_with(backend: Arc<dyn QuotaBackend<String>>, hook_order: HookOrder) -> Router {
        let rate_limiting = RateLimiting::builder(backend)
            .key_extraction(header_or_remote_origin("authorization"))
            .hook_order(hook_order)
            .build();
        rate_limited(routes(), Arc::new(rate_limiting))
    }

    fn app() -> Router {
        let backend = Arc::new(RateLimiter::<String>::new(5, Duration::from_secs(20)).unwrap());
        app_with(backend, HookOrder::Before)
    }

    fn request(method: Method, uri: &str, key: Option<&str>) -> Request {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header("authorization", key);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn remaining(response: &Response) -> Option<u64> {
        response
            .headers()
            .get(HEADER_REMAINING)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
    }

    #[tokio::test]
    async fn test_quota_consumed_on_request() {
        let response = app()
            .oneshot(request(Method::GET, "/", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(remaining(&response), Some(4));
        assert_eq!(response.headers()[HEADER_LIMIT], "5");
        assert!(response.headers().contains_key(HEADER_RESET));
        assert!(!response.headers().contains_key(RETRY_AFTER));
    }

    #[tokio::test]
    async fn test_following_requests_share_quota() {
        let app = app();

        app.clone()
            .oneshot(request(Method::GET, "/", None))
            .await
            .unwrap();
        let response = app.oneshot(request(Method::GET, "/", None)).await.unwrap();

        assert_eq!(remaining(&response), Some(3));
    }

    #[tokio::test]
    async fn test_options_request_not_counted() {
        let app = app();

        let preflight = app
            .clone()
            .oneshot(request(Method::OPTIONS, "/", None))
            .await
            .unwrap();
        assert_eq!(remaining(&preflight), None);

        let response = app.oneshot(request(Method::GET, "/", None)).await.unwrap();
        assert_eq!(remaining(&response), Some(4));
    }

    #[tokio::test]
    async fn test_health_check_not_counted() {
        let app = app();

        let health = app
            .clone()
            .oneshot(request(Method::GET, "/healthz", None))
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        assert_eq!(remaining(&health), None);

        let response = app.oneshot(request(Method::GET, "/", None)).await.unwrap();
        assert_eq!(remaining(&response), Some(4));
    }

    #[tokio::test]
    async fn test_different_keys_have_separate_quotas() {
        let app = app();

        let first = app
            .clone()
            .oneshot(request(Method::GET, "/", Some("0")))
            .await
            .unwrap();
        let second = app
            .oneshot(request(Method::GET, "/", Some("1")))
            .await
            .unwrap();

        assert_eq!(remaining(&first), Some(4));
        assert_eq!(remaining(&second), Some(4));
    }

    #[tokio::test]
    async fn test_exhausted_quota_rejected_with_retry_after() {
        let app = app();

        for expected in [4, 3, 2, 1, 0] {
            let response = app
                .clone()
                .oneshot(request(Method::GET, "/", None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(remaining(&response), Some(expected));
        }

        let response = app.oneshot(request(Method::GET, "/", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(remaining(&response), Some(0));

        let retry_after: u64 = response.headers()[RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after <= 20);
    }

    #[tokio::test]
    async fn test_rejected_request_skips_handler_before_hook() {
        let backend = Arc::new(RateLimiter::<String>::new(1, Duration::from_secs(20)).unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let routes = Router::new().route(
            "/",
            get(move || {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    "ok"
                }
            }),
        );
        let rate_limiting = RateLimiting::builder(backend).build();
        let app = rate_limited(routes, Arc::new(rate_limiting));

        app.clone()
            .oneshot(request(Method::GET, "/", None))
            .await
            .unwrap();
        let rejected = app.oneshot(request(Method::GET, "/", None)).await.unwrap();

        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_after_hook_replaces_response_on_rejection() {
        let backend = Arc::new(RateLimiter::<String>::new(1, Duration::from_secs(20)).unwrap());
        let app = app_with(backend, HookOrder::After);

        let admitted = app
            .clone()
            .oneshot(request(Method::GET, "/", None))
            .await
            .unwrap();
        assert_eq!(admitted.status(), StatusCode::OK);
        assert_eq!(remaining(&admitted), Some(0));

        let rejected = app.oneshot(request(Method::GET, "/", None)).await.unwrap();
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(rejected.headers().contains_key(RETRY_AFTER));
    }

    #[tokio::test]
    async fn test_custom_rejection_handler() {
        let backend = Arc::new(RateLimiter::<String>::new(1, Duration::from_secs(20)).unwrap());
        let rate_limiting = RateLimiting::builder(backend)
            .on_rejection(Arc::new(|_: &QuotaHeaders| {
                axum::response::IntoResponse::into_response(StatusCode::SERVICE_UNAVAILABLE)
            }))
            .build();
        let app = rate_limited(routes(), Arc::new(rate_limiting));

        app.clone()
            .oneshot(request(Method::GET, "/", None))
            .await
            .unwrap();
        let rejected = app.oneshot(request(Method::GET, "/", None)).await.unwrap();

        assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(remaining(&rejected), Some(0));
    }

    #[tokio::test]
    async fn test_serialized_backend_behind_middleware() {
        let backend = Arc::new(
            SerializedRateLimiter::<String>::new(5, Duration::from_secs(20), 8).unwrap(),
        );
        let app = app_with(backend, HookOrder::Before);

        let first = app
            .clone()
            .oneshot(request(Method::GET, "/", Some("K")))
            .await
            .unwrap();
        let other = app
            .clone()
            .oneshot(request(Method::GET, "/", Some("K2")))
            .await
            .unwrap();
        let second = app
            .oneshot(request(Method::GET, "/", Some("K")))
            .await
            .unwrap();

        assert_eq!(remaining(&first), Some(4));
        assert_eq!(remaining(&other), Some(4));
        assert_eq!(remaining(&second), Some(3));
    }
}
