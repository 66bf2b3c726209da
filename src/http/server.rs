//! HTTP server implementation.

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::policy::RateLimiting;
use super::rate_limited;
use crate::error::{Result, TurnstileError};

/// Routes served by the standalone binary.
///
/// `/` is rate limited; `/healthz` and `/readyz` are excluded by the default
/// exclusion policy.
pub fn default_routes() -> Router {
    Router::new()
        .route("/", get(|| async { "Rate limited" }))
        .route("/healthz", get(|| async { StatusCode::OK }))
        .route("/readyz", get(|| async { StatusCode::OK }))
}

/// HTTP server fronting a rate limited router.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The router with the rate limiting layer installed
    router: Router,
}

impl HttpServer {
    /// Create a server for `routes` limited by `rate_limiting`.
    pub fn new(addr: SocketAddr, routes: Router, rate_limiting: Arc<RateLimiting>) -> Self {
        Self {
            addr,
            router: rate_limited(routes, rate_limiting),
        }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves. Remote
    /// addresses are made available to key extraction through `ConnectInfo`.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;

        info!(
            addr = %listener.local_addr()?,
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimiter;
    use std::time::Duration;

    #[tokio::test]
    async fn test_server_serves_remote_origin_keyed_quota() {
        let limiter = Arc::new(RateLimiter::<String>::new(5, Duration::from_secs(20)).unwrap());
        let rate_limiting = Arc::new(RateLimiting::builder(limiter.clone()).build());

        // Bind to an ephemeral port first so the test knows the address.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let server = HttpServer::new(addr, default_routes(), rate_limiting);
        let handle = tokio::spawn(server.serve_with_shutdown(async {
            let _ = shutdown_rx.await;
        }));

        let mut stream = None;
        for _ in 0..50 {
            match tokio::net::TcpStream::connect(addr).await {
                Ok(connected) => {
                    stream = Some(connected);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        let mut stream = stream.expect("server did not start");

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();

        assert!(raw.starts_with("HTTP/1.1 200"));
        assert!(raw.to_ascii_lowercase().contains("x-ratelimit-remaining: 4"));
        assert_eq!(limiter.get(&"127.0.0.1".to_string()).remaining_requests, 4);

        let _ = shutdown_tx.send(());
        handle.await.unwrap().unwrap();
    }
}
