//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{
    PurgePolicy, QuotaPolicy, DEFAULT_LIMIT, DEFAULT_PURGE_INTERVAL, DEFAULT_PURGE_THRESHOLD,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_WINDOW,
};

/// Prefix of environment variables that override file settings.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// How quota updates are applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Lock-free compare-and-commit retries
    #[default]
    Atomic,
    /// A bounded queue drained by a single writer task
    Serialized,
}

/// Whether quota is accounted before or after the request handler runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookOrder {
    /// Check first; rejected requests never reach the handler
    #[default]
    Before,
    /// Run the handler, then account; a rejection replaces its response
    After,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Operations permitted per key per window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window duration in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Update strategy
    #[serde(default)]
    pub strategy: Strategy,

    /// Queue capacity for the serialized strategy
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Store size above which expired records are purged
    #[serde(default = "default_purge_threshold")]
    pub purge_threshold: usize,

    /// Minimum seconds between purges
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,

    /// Path suffixes that are never rate limited
    #[serde(default = "default_excluded_paths")]
    pub excluded_paths: Vec<String>,

    /// Request header to key quotas by instead of the remote address
    #[serde(default)]
    pub key_header: Option<String>,

    /// When quota is accounted relative to the handler
    #[serde(default)]
    pub hook_order: HookOrder,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_secs: default_window_secs(),
            strategy: Strategy::default(),
            queue_capacity: default_queue_capacity(),
            purge_threshold: default_purge_threshold(),
            purge_interval_secs: default_purge_interval_secs(),
            excluded_paths: default_excluded_paths(),
            key_header: None,
            hook_order: HookOrder::default(),
        }
    }
}

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

fn default_window_secs() -> u64 {
    DEFAULT_WINDOW.as_secs()
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_purge_threshold() -> usize {
    DEFAULT_PURGE_THRESHOLD
}

fn default_purge_interval_secs() -> u64 {
    DEFAULT_PURGE_INTERVAL.as_secs()
}

fn default_excluded_paths() -> Vec<String> {
    vec!["/healthz".to_string(), "/readyz".to_string()]
}

impl RateLimitingConfig {
    /// Window duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Build the validated quota policy.
    pub fn quota_policy(&self) -> Result<QuotaPolicy> {
        QuotaPolicy::new(self.limit, self.window())
    }

    /// Build the purge policy.
    pub fn purge_policy(&self) -> PurgePolicy {
        PurgePolicy {
            threshold: self.purge_threshold,
            interval: Duration::from_secs(self.purge_interval_secs),
        }
    }
}

impl TurnstileConfig {
    /// Load configuration from an optional file, overridden by environment variables.
    ///
    /// Environment variables use the `TURNSTILE__` prefix and `__` as the
    /// nesting separator, e.g. `TURNSTILE__RATE_LIMITING__LIMIT=50`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path));
        }

        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would produce undefined limiter behavior.
    pub fn validate(&self) -> Result<()> {
        let rate_limiting = &self.rate_limiting;
        rate_limiting.quota_policy()?;

        if rate_limiting.strategy == Strategy::Serialized && rate_limiting.queue_capacity == 0 {
            return Err(TurnstileError::Config(
                "queue_capacity must be greater than zero".to_string(),
            ));
        }
        if rate_limiting.purge_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "purge_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();
        assert_eq!(config.rate_limiting.limit, 1000);
        assert_eq!(config.rate_limiting.window(), Duration::from_secs(3600));
        assert_eq!(config.rate_limiting.strategy, Strategy::Atomic);
        assert_eq!(config.rate_limiting.hook_order, HookOrder::Before);
        assert_eq!(
            config.rate_limiting.purge_policy(),
            PurgePolicy::default()
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
rate_limiting:
  limit: 5
  window_secs: 20
  strategy: serialized
  key_header: authorization
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.rate_limiting.limit, 5);
        assert_eq!(config.rate_limiting.window_secs, 20);
        assert_eq!(config.rate_limiting.strategy, Strategy::Serialized);
        assert_eq!(config.rate_limiting.key_header.as_deref(), Some("authorization"));
        assert_eq!(config.rate_limiting.excluded_paths, default_excluded_paths());
        assert_eq!(config.server.http_addr, default_http_addr());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let yaml = r#"
rate_limiting:
  limit: 0
"#;
        assert!(matches!(
            TurnstileConfig::from_yaml(yaml),
            Err(TurnstileError::Config(_))
        ));
    }

    #[test]
    fn test_zero_window_rejected() {
        let yaml = r#"
rate_limiting:
  window_secs: 0
"#;
        assert!(TurnstileConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = TurnstileConfig::load(None).unwrap();
        assert!(config.rate_limiting.limit > 0);
    }
}
