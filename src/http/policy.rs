//! Request policies for the HTTP rate limiting layer.
//!
//! A [`RateLimiting`] bundles the quota backend with the policies that map a
//! request onto it: which key a request counts against, which requests are
//! exempt, what a rejection looks like, and whether accounting happens before
//! or after the handler. Defaults are resolved when the bundle is built.

use axum::extract::{ConnectInfo, Request};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use super::headers::QuotaHeaders;
use crate::config::{HookOrder, RateLimitingConfig, Strategy};
use crate::error::Result;
use crate::ratelimit::{Admission, QuotaBackend, RateLimiter, SerializedRateLimiter};

/// Maps a request to the key its quota is tracked under.
pub type KeyExtractor = Arc<dyn Fn(&Request) -> String + Send + Sync>;
/// Decides whether a request is exempt from rate limiting.
pub type PathExclusion = Arc<dyn Fn(&Method, &str) -> bool + Send + Sync>;
/// Produces the response sent when a request is rejected.
pub type RejectionHandler = Arc<dyn Fn(&QuotaHeaders) -> Response + Send + Sync>;

/// Key used when no remote address is known.
const UNKNOWN_ORIGIN: &str = "unknown";

/// Key requests by the IP address of the remote peer.
pub fn remote_origin(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_ORIGIN.to_string())
}

/// Key requests by a header value, falling back to the remote origin.
pub fn header_or_remote_origin(header: impl Into<String>) -> KeyExtractor {
    let header = header.into();
    Arc::new(move |request: &Request| {
        request
            .headers()
            .get(header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| remote_origin(request))
    })
}

/// Exempt pre-flight requests and paths ending in any of `suffixes`.
pub fn exclude_preflight_and_suffixes(suffixes: Vec<String>) -> PathExclusion {
    Arc::new(move |method: &Method, path: &str| {
        *method == Method::OPTIONS || suffixes.iter().any(|suffix| path.ends_with(suffix.as_str()))
    })
}

/// Exempt pre-flight requests and health/readiness checks.
pub fn exclude_preflight_and_health_checks(method: &Method, path: &str) -> bool {
    *method == Method::OPTIONS || path.ends_with("/healthz") || path.ends_with("/readyz")
}

/// Respond with `429 Too Many Requests`.
pub fn too_many_requests(headers: &QuotaHeaders) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({
            "error": "Too Many Requests",
            "quota": headers,
        })),
    )
        .into_response()
}

/// The rate limiting policy installed into an HTTP router.
pub struct RateLimiting {
    backend: Arc<dyn QuotaBackend<String>>,
    key_extraction: KeyExtractor,
    path_exclusion: PathExclusion,
    on_rejection: RejectionHandler,
    hook_order: HookOrder,
}

impl RateLimiting {
    /// Start building a policy around a quota backend.
    pub fn builder(backend: Arc<dyn QuotaBackend<String>>) -> RateLimitingBuilder {
        RateLimitingBuilder {
            backend,
            key_extraction: None,
            path_exclusion: None,
            on_rejection: None,
            hook_order: HookOrder::default(),
        }
    }

    /// Build a policy and its backend from configuration.
    ///
    /// The serialized strategy spawns its worker, so this must run inside a
    /// Tokio runtime.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        let policy = config.quota_policy()?;
        let backend: Arc<dyn QuotaBackend<String>> = match config.strategy {
            Strategy::Atomic => Arc::new(RateLimiter::<String>::with_policies(
                policy,
                config.purge_policy(),
            )),
            Strategy::Serialized => Arc::new(SerializedRateLimiter::<String>::spawn(
                policy,
                config.purge_policy(),
                config.queue_capacity,
            )?),
        };

        info!(
            limit = policy.limit(),
            window_secs = policy.window().as_secs(),
            strategy = ?config.strategy,
            hook_order = ?config.hook_order,
            "Rate limiting configured"
        );

        let mut builder = Self::builder(backend)
            .path_exclusion(exclude_preflight_and_suffixes(config.excluded_paths.clone()))
            .hook_order(config.hook_order);
        if let Some(header) = &config.key_header {
            builder = builder.key_extraction(header_or_remote_origin(header.clone()));
        }
        Ok(builder.build())
    }

    /// The quota backend.
    pub fn backend(&self) -> &Arc<dyn QuotaBackend<String>> {
        &self.backend
    }

    /// Configured limit per window.
    pub fn limit(&self) -> u64 {
        self.backend.policy().limit()
    }

    /// When quota is accounted relative to the handler.
    pub fn hook_order(&self) -> HookOrder {
        self.hook_order
    }

    /// Whether the request is exempt from limiting.
    pub fn is_excluded(&self, method: &Method, path: &str) -> bool {
        (self.path_exclusion)(method, path)
    }

    /// The key the request counts against.
    pub fn key_for(&self, request: &Request) -> String {
        (self.key_extraction)(request)
    }

    /// The response for a rejected request.
    pub fn reject(&self, headers: &QuotaHeaders) -> Response {
        (self.on_rejection)(headers)
    }

    /// Atomically admit one request for `key`.
    ///
    /// Returns `None` if the backend could not record the request; the
    /// caller lets such requests through.
    pub async fn admit(&self, key: String) -> Option<Admission> {
        match self.backend.try_consume(key).await {
            Ok(admission) => Some(admission),
            Err(e) => {
                error!(error = %e, "Failed to record request against quota");
                None
            }
        }
    }
}

/// Builder for [`RateLimiting`] with documented defaults.
pub struct RateLimitingBuilder {
    backend: Arc<dyn QuotaBackend<String>>,
    key_extraction: Option<KeyExtractor>,
    path_exclusion: Option<PathExclusion>,
    on_rejection: Option<RejectionHandler>,
    hook_order: HookOrder,
}

impl RateLimitingBuilder {
    /// Key extraction policy. Defaults to [`remote_origin`].
    pub fn key_extraction(mut self, key_extraction: KeyExtractor) -> Self {
        self.key_extraction = Some(key_extraction);
        self
    }

    /// Exclusion policy. Defaults to [`exclude_preflight_and_health_checks`].
    pub fn path_exclusion(mut self, path_exclusion: PathExclusion) -> Self {
        self.path_exclusion = Some(path_exclusion);
        self
    }

    /// Rejection response. Defaults to [`too_many_requests`].
    pub fn on_rejection(mut self, on_rejection: RejectionHandler) -> Self {
        self.on_rejection = Some(on_rejection);
        self
    }

    /// Hook order. Defaults to [`HookOrder::Before`].
    pub fn hook_order(mut self, hook_order: HookOrder) -> Self {
        self.hook_order = hook_order;
        self
    }

    /// Resolve defaults and build the policy.
    pub fn build(self) -> RateLimiting {
        RateLimiting {
            backend: self.backend,
            key_extraction: self
                .key_extraction
                .unwrap_or_else(|| Arc::new(remote_origin) as KeyExtractor),
            path_exclusion: self
                .path_exclusion
                .unwrap_or_else(|| Arc::new(exclude_preflight_and_health_checks) as PathExclusion),
            on_rejection: self
                .on_rejection
                .unwrap_or_else(|| Arc::new(too_many_requests) as RejectionHandler),
            hook_order: self.hook_order,
        }
    }
}
