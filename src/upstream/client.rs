//! Upstream client: pooled data requests plus an independent health probe.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::Method;
use tokio::time::Instant;

use super::pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
use crate::config::{HealthConfig, UpstreamConfig};
use crate::error::{Error, Result};

/// Result of a single liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Upstream answered with an HTTP status.
    Responded { status: u16, latency: Duration },
    /// No HTTP answer: refused, reset, or timed out.
    Failed { error: String, latency: Duration },
}

impl ProbeOutcome {
    pub fn latency(&self) -> Duration {
        match self {
            ProbeOutcome::Responded { latency, .. } | ProbeOutcome::Failed { latency, .. } => {
                *latency
            }
        }
    }
}

/// Client for the single configured upstream.
///
/// Data requests go through the bounded [`ConnectionPool`]; probes use their
/// own client so a saturated pool never masks upstream liveness.
pub struct UpstreamClient {
    base_url: String,
    pool: ConnectionPool,
    probe_client: reqwest::Client,
    response_timeout: Duration,
}

impl UpstreamClient {
    /// Build the client and its (empty) pool.
    pub fn new(upstream: &UpstreamConfig, health: &HealthConfig) -> Result<Self> {
        let pool = ConnectionPool::new(PoolConfig {
            max_size: upstream.pool_size,
            idle_ttl: upstream.idle_ttl(),
            acquire_timeout: upstream.acquire_timeout(),
            connect_timeout: upstream.connect_timeout(),
        });

        let probe_client = reqwest::Client::builder()
            .connect_timeout(health.probe_timeout())
            .timeout(health.probe_timeout())
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build probe client: {}", e)))?;

        Ok(Self {
            base_url: upstream.url.trim_end_matches('/').to_string(),
            pool,
            probe_client,
            response_timeout: upstream.response_timeout(),
        })
    }

    /// Base address of the upstream, without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full URL for an upstream path (path must start with '/').
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Lease a pooled connection.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.pool.acquire().await
    }

    /// Return a lease; `reusable = false` closes the connection.
    pub fn release(&self, connection: PooledConnection, reusable: bool) {
        connection.release(reusable);
    }

    /// Send a request over a leased connection and wait for response headers.
    ///
    /// The wait is bounded by the response timeout; the body is not.
    pub async fn send(
        &self,
        connection: &PooledConnection,
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response> {
        let client = connection
            .client()
            .ok_or_else(|| Error::Internal("lease holds no connection".to_string()))?;
        let url = self.endpoint(path_and_query);

        let request = client.request(method, &url).headers(headers).body(body);

        match tokio::time::timeout(self.response_timeout, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(classify_send_error(&e)),
            Err(_) => Err(Error::Timeout(format!(
                "no response headers from {} within {}ms",
                url,
                self.response_timeout.as_millis()
            ))),
        }
    }

    /// Probe upstream liveness with a GET on `path`.
    pub async fn probe(&self, path: &str) -> ProbeOutcome {
        let url = self.endpoint(path);
        let start = Instant::now();

        match self.probe_client.get(&url).send().await {
            Ok(response) => ProbeOutcome::Responded {
                status: response.status().as_u16(),
                latency: start.elapsed(),
            },
            Err(e) => {
                let error = if e.is_timeout() {
                    "probe timed out".to_string()
                } else if e.is_connect() {
                    format!("connection failed: {}", error_chain(&e))
                } else {
                    format!("probe failed: {}", error_chain(&e))
                };
                ProbeOutcome::Failed {
                    error,
                    latency: start.elapsed(),
                }
            }
        }
    }

    /// Stop handing out connections (shutdown).
    pub fn close(&self) {
        self.pool.close();
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

/// Map a failure to obtain response headers onto the error taxonomy.
///
/// Timeouts and connect failures are transient; anything else the
/// transport reports is a protocol-level fault and is not retried.
pub fn classify_send_error(e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(error_chain(e))
    } else if e.is_connect() {
        Error::ConnectFailure(error_chain(e))
    } else {
        Error::UpstreamProtocol(error_chain(e))
    }
}

/// Map a failure while reading an already-started response body.
pub fn classify_stream_error(e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(error_chain(e))
    } else {
        Error::UpstreamProtocol(error_chain(e))
    }
}

/// Render an error with its source chain ("a: b: c").
fn error_chain(e: &(dyn std::error::Error + 'static)) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
