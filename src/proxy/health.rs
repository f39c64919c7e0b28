//! Upstream health monitoring.
//!
//! A background task probes the upstream at a fixed interval and publishes
//! the latest [`HealthStatus`] through a `tokio::sync::watch` channel held by
//! the shared [`UpstreamTarget`]. Readers take the cached value and never
//! wait on a live probe.
//!
//! Classification uses only the most recent probe:
//! - **Healthy**: 2xx within the latency threshold
//! - **Degraded**: 2xx slower than the threshold
//! - **Down**: non-2xx, connect failure, or probe timeout

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::HealthConfig;
use crate::upstream::{ProbeOutcome, UpstreamClient};

/// Health of the upstream as seen by the last probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Down,
}

impl HealthState {
    /// Lowercase string representation for JSON serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Down => "down",
        }
    }
}

/// Snapshot of the latest probe.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthStatus {
    pub state: HealthState,
    /// `None` until the first probe completes.
    pub last_probed: Option<DateTime<Utc>>,
    pub latency: Option<Duration>,
    pub last_error: Option<String>,
}

impl HealthStatus {
    /// Status before any probe has completed.
    pub fn unprobed() -> Self {
        Self {
            state: HealthState::Down,
            last_probed: None,
            latency: None,
            last_error: None,
        }
    }

    fn from_probe(outcome: &ProbeOutcome, latency_threshold: Duration) -> Self {
        let last_error = match outcome {
            ProbeOutcome::Responded { status, .. } if !is_success(*status) => {
                Some(format!("probe returned HTTP {}", status))
            }
            ProbeOutcome::Responded { .. } => None,
            ProbeOutcome::Failed { error, .. } => Some(error.clone()),
        };
        Self {
            state: classify(outcome, latency_threshold),
            last_probed: Some(Utc::now()),
            latency: Some(outcome.latency()),
            last_error,
        }
    }
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Map one probe outcome to a health state.
pub fn classify(outcome: &ProbeOutcome, latency_threshold: Duration) -> HealthState {
    match outcome {
        ProbeOutcome::Responded { status, latency } if is_success(*status) => {
            if *latency <= latency_threshold {
                HealthState::Healthy
            } else {
                HealthState::Degraded
            }
        }
        _ => HealthState::Down,
    }
}

/// The configured upstream and its latest health.
///
/// Mutated only by the health monitor; one shared instance per process.
#[derive(Debug)]
pub struct UpstreamTarget {
    base_url: String,
    status: watch::Sender<HealthStatus>,
}

impl UpstreamTarget {
    pub fn new(base_url: impl Into<String>) -> Self {
        let (status, _) = watch::channel(HealthStatus::unprobed());
        Self {
            base_url: base_url.into(),
            status,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn current_status(&self) -> HealthStatus {
        self.status.borrow().clone()
    }

    /// Subscribe to status updates.
    pub fn subscribe(&self) -> watch::Receiver<HealthStatus> {
        self.status.subscribe()
    }

    /// Replace the status; returns the previous state.
    fn publish(&self, status: HealthStatus) -> HealthState {
        self.status.send_replace(status).state
    }
}

/// Periodic prober for one [`UpstreamTarget`].
pub struct HealthMonitor {
    client: Arc<UpstreamClient>,
    target: Arc<UpstreamTarget>,
    path: String,
    interval: Duration,
    latency_threshold: Duration,
}

impl HealthMonitor {
    pub fn new(client: Arc<UpstreamClient>, config: &HealthConfig) -> Self {
        let target = Arc::new(UpstreamTarget::new(client.base_url()));
        Self {
            client,
            target,
            path: config.path.clone(),
            interval: config.interval(),
            latency_threshold: config.latency_threshold(),
        }
    }

    pub fn target(&self) -> &Arc<UpstreamTarget> {
        &self.target
    }

    /// Latest cached status. Never probes.
    pub fn current_status(&self) -> HealthStatus {
        self.target.current_status()
    }

    /// Run one probe and publish the result.
    pub async fn probe_once(&self) -> HealthStatus {
        let outcome = self.client.probe(&self.path).await;
        let status = HealthStatus::from_probe(&outcome, self.latency_threshold);
        let previous = self.target.publish(status.clone());

        if previous != status.state {
            let latency_ms = status.latency.map(|l| l.as_millis() as u64);
            match status.state {
                HealthState::Healthy => tracing::info!(
                    upstream = %self.target.base_url(),
                    from = previous.as_str(),
                    to = status.state.as_str(),
                    latency_ms,
                    "upstream health changed"
                ),
                HealthState::Degraded | HealthState::Down => tracing::warn!(
                    upstream = %self.target.base_url(),
                    from = previous.as_str(),
                    to = status.state.as_str(),
                    latency_ms,
                    error = status.last_error.as_deref().unwrap_or(""),
                    "upstream health changed"
                ),
            }
        } else {
            tracing::trace!(
                upstream = %self.target.base_url(),
                state = status.state.as_str(),
                "probe complete"
            );
        }

        status
    }

    /// Spawn the probe loop. The first probe runs immediately; the loop
    /// exits when `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::debug!(
                upstream = %self.target.base_url(),
                interval_ms = self.interval.as_millis() as u64,
                "starting health monitor"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = self.probe_once() => {}
                        }
                    }
                }
            }

            tracing::debug!(upstream = %self.target.base_url(), "health monitor stopped");
        })
    }
}
