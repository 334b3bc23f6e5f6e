//! Runtime configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::health::ConfigChecks;
use crate::validation::validate_upstream_url;

/// Configuration for the webhook reliability service.
#[derive(Clone)]
pub struct ReliabilityConfig {
    /// Listen address for the HTTP server.
    pub listen_addr: SocketAddr,

    /// Database connection URL. The in-memory store is used when unset.
    pub database_url: Option<String>,

    /// Shared secret for inbound signatures. Required at startup.
    pub webhook_secret: Option<String>,

    /// Base URL of the agent platform API.
    pub upstream_base_url: Option<String>,

    /// Bearer token for the agent platform API.
    pub upstream_api_key: Option<String>,

    /// Permit plain HTTP and private hosts for the upstream URL (local development only).
    pub upstream_allow_http: bool,

    /// Token required on administrative routes. Admin routes are disabled when unset.
    pub admin_token: Option<String>,

    pub signature_tolerance_secs: u64,

    /// Treat events as new when the dedup lookup cannot reach the store.
    /// When false (default), the request fails with a retriable error.
    pub dedup_fail_open: bool,

    pub breaker_failure_threshold: u32,
    pub breaker_success_threshold: u32,
    pub breaker_cooldown_secs: u64,
    pub breaker_max_cooldown_secs: u64,
    pub breaker_half_open_max_calls: u32,

    /// Deadline applied to every Event Store and upstream call.
    pub dependency_timeout_ms: u64,

    pub fallback_cache_capacity: usize,

    /// Directory for the persistent cache tier. Memory-only when unset.
    pub fallback_cache_dir: Option<PathBuf>,

    pub alert_silence_timeout_secs: u64,
    /// Cap on concurrently active alerts.
    pub alert_max_active: usize,
    pub health_cache_ttl_secs: u64,
    pub health_degraded_cache_ttl_secs: u64,
    pub trigger_daily_limit: u32,
    pub store_probe_interval_secs: u64,

    /// Default log filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            webhook_secret: None,
            upstream_base_url: None,
            upstream_api_key: None,
            upstream_allow_http: false,
            admin_token: None,
            signature_tolerance_secs: 300,
            dedup_fail_open: false,
            breaker_failure_threshold: 5,
            breaker_success_threshold: 2,
            breaker_cooldown_secs: 30,
            breaker_max_cooldown_secs: 300,
            breaker_half_open_max_calls: 1,
            dependency_timeout_ms: 5000,
            fallback_cache_capacity: 50,
            fallback_cache_dir: None,
            alert_silence_timeout_secs: 1800,
            alert_max_active: 1000,
            health_cache_ttl_secs: 30,
            health_degraded_cache_ttl_secs: 300,
            trigger_daily_limit: 100,
            store_probe_interval_secs: 60,
            log_filter: "info".to_string(),
        }
    }
}

impl ReliabilityConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Load configuration from a custom variable reader.
    ///
    /// This allows tests to supply variables without mutating process-global
    /// environment state.
    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let defaults = Self::default();
        let optional = |key: &str| {
            reader(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let upstream_allow_http = parse_or(&reader, "UPSTREAM_ALLOW_HTTP", false)?;
        let upstream_base_url = optional("UPSTREAM_BASE_URL");
        if let Some(url) = &upstream_base_url {
            validate_upstream_url(url, upstream_allow_http).map_err(|e| {
                ConfigError::InvalidValue("UPSTREAM_BASE_URL".into(), e.to_string())
            })?;
        }

        let config = Self {
            listen_addr: parse_or(&reader, "LISTEN_ADDR", defaults.listen_addr)?,
            database_url: optional("DATABASE_URL"),
            webhook_secret: optional("WEBHOOK_SIGNING_SECRET"),
            upstream_base_url,
            upstream_api_key: optional("UPSTREAM_API_KEY"),
            upstream_allow_http,
            admin_token: optional("ADMIN_TOKEN"),
            signature_tolerance_secs: parse_or(
                &reader,
                "SIGNATURE_TOLERANCE_SECS",
                defaults.signature_tolerance_secs,
            )?,
            dedup_fail_open: parse_or(&reader, "DEDUP_FAIL_OPEN", defaults.dedup_fail_open)?,
            breaker_failure_threshold: parse_or(
                &reader,
                "BREAKER_FAILURE_THRESHOLD",
                defaults.breaker_failure_threshold,
            )?,
            breaker_success_threshold: parse_or(
                &reader,
                "BREAKER_SUCCESS_THRESHOLD",
                defaults.breaker_success_threshold,
            )?,
            breaker_cooldown_secs: parse_or(
                &reader,
                "BREAKER_COOLDOWN_SECS",
                defaults.breaker_cooldown_secs,
            )?,
            breaker_max_cooldown_secs: parse_or(
                &reader,
                "BREAKER_MAX_COOLDOWN_SECS",
                defaults.breaker_max_cooldown_secs,
            )?,
            breaker_half_open_max_calls: parse_or(
                &reader,
                "BREAKER_HALF_OPEN_MAX_CALLS",
                defaults.breaker_half_open_max_calls,
            )?,
            dependency_timeout_ms: parse_or(
                &reader,
                "DEPENDENCY_TIMEOUT_MS",
                defaults.dependency_timeout_ms,
            )?,
            fallback_cache_capacity: parse_or(
                &reader,
                "FALLBACK_CACHE_CAPACITY",
                defaults.fallback_cache_capacity,
            )?,
            fallback_cache_dir: optional("FALLBACK_CACHE_DIR").map(PathBuf::from),
            alert_silence_timeout_secs: parse_or(
                &reader,
                "ALERT_SILENCE_TIMEOUT_SECS",
                defaults.alert_silence_timeout_secs,
            )?,
            alert_max_active: parse_or(&reader, "ALERT_MAX_ACTIVE", defaults.alert_max_active)?,
            health_cache_ttl_secs: parse_or(
                &reader,
                "HEALTH_CACHE_TTL_SECS",
                defaults.health_cache_ttl_secs,
            )?,
            health_degraded_cache_ttl_secs: parse_or(
                &reader,
                "HEALTH_DEGRADED_CACHE_TTL_SECS",
                defaults.health_degraded_cache_ttl_secs,
            )?,
            trigger_daily_limit: parse_or(
                &reader,
                "TRIGGER_DAILY_LIMIT",
                defaults.trigger_daily_limit,
            )?,
            store_probe_interval_secs: parse_or(
                &reader,
                "STORE_PROBE_INTERVAL_SECS",
                defaults.store_probe_interval_secs,
            )?,
            log_filter: optional("LOG_FILTER").unwrap_or(defaults.log_filter),
        };

        if config.breaker_failure_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "BREAKER_FAILURE_THRESHOLD".into(),
                "must be at least 1".into(),
            ));
        }
        if config.dependency_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "DEPENDENCY_TIMEOUT_MS".into(),
                "must be at least 1".into(),
            ));
        }

        Ok(config)
    }

    /// The signing secret, or an error naming the missing variable.
    pub fn require_webhook_secret(&self) -> Result<&str, ConfigError> {
        self.webhook_secret
            .as_deref()
            .ok_or_else(|| ConfigError::MissingVar("WEBHOOK_SIGNING_SECRET".into()))
    }

    #[must_use]
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_failure_threshold(self.breaker_failure_threshold)
            .with_success_threshold(self.breaker_success_threshold)
            .with_cooldown(self.breaker_cooldown_secs)
            .with_max_cooldown(self.breaker_max_cooldown_secs)
            .with_half_open_max_calls(self.breaker_half_open_max_calls)
    }

    #[must_use]
    pub fn dependency_timeout(&self) -> Duration {
        Duration::from_millis(self.dependency_timeout_ms)
    }

    #[must_use]
    pub fn config_checks(&self) -> ConfigChecks {
        ConfigChecks {
            webhook_secret_configured: self.webhook_secret.is_some(),
            upstream_url_configured: self.upstream_base_url.is_some(),
            database_configured: self.database_url.is_some(),
            admin_token_configured: self.admin_token.is_some(),
        }
    }
}

impl std::fmt::Debug for ReliabilityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliabilityConfig")
            .field("listen_addr", &self.listen_addr)
            .field("database_configured", &self.database_url.is_some())
            .field("webhook_secret_configured", &self.webhook_secret.is_some())
            .field("upstream_base_url", &self.upstream_base_url)
            .field("admin_token_configured", &self.admin_token.is_some())
            .field("dedup_fail_open", &self.dedup_fail_open)
            .field("dependency_timeout_ms", &self.dependency_timeout_ms)
            .field("fallback_cache_dir", &self.fallback_cache_dir)
            .finish_non_exhaustive()
    }
}

fn parse_or<F, T>(reader: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match reader(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        _ => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}
