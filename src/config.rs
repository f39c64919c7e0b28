//! Configuration parsing and validation for inferproxy.
//!
//! The core never reads files or the environment itself; `main` builds a
//! [`Config`] once at startup and hands it to [`crate::proxy::run_server`].

use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Paths served by the proxy itself; routes may not shadow them.
pub const RESERVED_PATHS: &[&str] = &["/health", "/health/details"];

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            health: HealthConfig::default(),
            relay: RelayConfig::default(),
            shutdown: ShutdownConfig::default(),
            logging: LoggingConfig::default(),
            routes: default_routes(),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8000")
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Largest inbound request body accepted, in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_listen() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_max_body_bytes() -> usize {
    4 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Upstream target and connection pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the inference backend (e.g., "http://localhost:11434").
    /// May contain `${VAR}` references.
    #[serde(default = "default_upstream_url")]
    pub url: String,
    /// Maximum number of simultaneously leased connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Idle connections older than this are evicted on the next pool scan
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    /// How long `acquire` waits for a free connection before `PoolExhausted`
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// TCP connect timeout
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Time allowed between sending the request and receiving response headers
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
}

fn default_upstream_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_pool_size() -> usize {
    16
}

fn default_idle_ttl_secs() -> u64 {
    90
}

fn default_acquire_timeout_ms() -> u64 {
    2_000
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_response_timeout_secs() -> u64 {
    300
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            pool_size: default_pool_size(),
            idle_ttl_secs: default_idle_ttl_secs(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_secs: default_response_timeout_secs(),
        }
    }
}

impl UpstreamConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

/// Health probe configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Path probed on the upstream (Ollama answers 200 on "/")
    #[serde(default = "default_health_path")]
    pub path: String,
    /// Interval between background probes
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Timeout for a single probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Successful probes slower than this report Degraded
    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: u64,
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_interval_ms() -> u64 {
    5_000
}

fn default_probe_timeout_ms() -> u64 {
    1_000
}

fn default_latency_threshold_ms() -> u64 {
    500
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval_ms: default_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            latency_threshold_ms: default_latency_threshold_ms(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn latency_threshold(&self) -> Duration {
        Duration::from_millis(self.latency_threshold_ms)
    }
}

/// Streaming relay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Upper bound on the size of a single chunk written to the caller
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,
}

fn default_max_chunk_bytes() -> usize {
    64 * 1024
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: default_max_chunk_bytes(),
        }
    }
}

/// Graceful shutdown configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// How long in-flight sessions may drain before being force-closed
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

fn default_grace_period_secs() -> u64 {
    10
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// A forwarding route: inbound path to upstream endpoint path.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RouteConfig {
    /// Inbound path (exact match, e.g. "/chat")
    pub path: String,
    /// Path appended to the upstream base URL (e.g. "/api/chat")
    pub upstream_path: String,
    /// Top-level JSON fields that must be present and non-empty
    #[serde(default)]
    pub required_fields: Vec<String>,
}

/// Routes served when the configuration declares none.
pub fn default_routes() -> Vec<RouteConfig> {
    vec![
        RouteConfig {
            path: "/chat".to_string(),
            upstream_path: "/api/chat".to_string(),
            required_fields: vec!["model".to_string()],
        },
        RouteConfig {
            path: "/completion".to_string(),
            upstream_path: "/api/generate".to_string(),
            required_fields: vec!["model".to_string()],
        },
    ]
}

impl Config {
    /// Load configuration from a TOML file, expanding `${VAR}` references
    /// from the process environment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_str(&content)
    }

    /// Parse configuration from a TOML string using the process environment.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse_str_with(content, |name| std::env::var(name).ok())
    }

    /// Parse configuration from a TOML string with a custom variable lookup.
    ///
    /// The closure keeps expansion testable without touching global env state.
    pub fn parse_str_with<F>(content: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.upstream.url = expand_env_vars_with(&config.upstream.url, "upstream.url", lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.upstream.url.trim();
        if url.is_empty() {
            return Err(ConfigError::Validation(
                "upstream.url must not be empty".to_string(),
            ));
        }
        let parsed = reqwest::Url::parse(url).map_err(|e| {
            ConfigError::Validation(format!("upstream.url '{}' is not a valid URL: {}", url, e))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::Validation(format!(
                "upstream.url must use http or https, got '{}'",
                parsed.scheme()
            )));
        }

        if self.upstream.pool_size == 0 {
            return Err(ConfigError::Validation(
                "upstream.pool_size must be at least 1".to_string(),
            ));
        }
        if self.upstream.acquire_timeout_ms == 0
            || self.upstream.connect_timeout_ms == 0
            || self.upstream.response_timeout_secs == 0
        {
            return Err(ConfigError::Validation(
                "upstream timeouts must be non-zero".to_string(),
            ));
        }
        if self.health.interval_ms == 0 || self.health.probe_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "health.interval_ms and health.probe_timeout_ms must be non-zero".to_string(),
            ));
        }
        if !self.health.path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "health.path '{}' must start with '/'",
                self.health.path
            )));
        }
        if self.relay.max_chunk_bytes == 0 {
            return Err(ConfigError::Validation(
                "relay.max_chunk_bytes must be non-zero".to_string(),
            ));
        }

        if self.routes.is_empty() {
            tracing::warn!("No routes configured - proxy will answer 404 to every request");
        }

        let mut seen = HashSet::new();
        for route in &self.routes {
            if !route.path.starts_with('/') || !route.upstream_path.starts_with('/') {
                return Err(ConfigError::Validation(format!(
                    "Route '{}' -> '{}': paths must start with '/'",
                    route.path, route.upstream_path
                )));
            }
            if RESERVED_PATHS.contains(&route.path.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Route path '{}' is reserved",
                    route.path
                )));
            }
            if !seen.insert(route.path.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate route path '{}'",
                    route.path
                )));
            }
        }

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for '{field}': {message}")]
    EnvVar {
        var: String,
        field: String,
        message: String,
    },
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string (e.g., `${SCHEME}://${HOST}:11434`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(input: &str, field: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            field: field.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                field: field.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            field: field.to_string(),
            message: format!("Environment variable '{}' is not set", var_name),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}
