//! Connect-phase failure policy.
//!
//! This module encapsulates the retry-once algorithm:
//! - Transient connect-phase errors (`ConnectFailure`, `Timeout`) get exactly
//!   one more attempt on a freshly acquired connection
//! - Everything else fails fast
//! - Attempt tracking via a shared [`AttemptLog`] that survives cancellation
//!   of the forwarding future
//! - Header formatting for `x-inferproxy-attempts`

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue};

use crate::error::{Error, FailureCategory, Result};

/// Total connect attempts per session (one initial plus one retry).
pub const MAX_CONNECT_ATTEMPTS: u32 = 2;

/// Pause before the retry, long enough for a restarting upstream to
/// re-open its listener.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

pub const ATTEMPTS_HEADER: &str = "x-inferproxy-attempts";
pub const SESSION_ID_HEADER: &str = "x-inferproxy-session-id";

/// What to do after a connect-phase error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Try once more on a fresh connection.
    RetryOnce,
    /// Surface the error immediately.
    FailFast,
}

pub fn policy_for(err: &Error) -> FailurePolicy {
    if err.is_transient() {
        FailurePolicy::RetryOnce
    } else {
        FailurePolicy::FailFast
    }
}

/// Record of a single failed connect attempt.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub category: FailureCategory,
    pub message: String,
}

/// Connect attempts made for one session.
///
/// Shared behind an `Arc` so the caller can still read it when the
/// forwarding future is dropped mid-attempt.
#[derive(Debug, Default)]
pub struct AttemptLog {
    started: AtomicU32,
    failures: Mutex<Vec<AttemptRecord>>,
}

impl AttemptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attempts that were started, including one still in flight.
    pub fn started(&self) -> u32 {
        self.started.load(Ordering::Relaxed)
    }

    /// Failed attempts, in order.
    pub fn failures(&self) -> Vec<AttemptRecord> {
        self.failures
            .lock()
            .map(|failures| failures.clone())
            .unwrap_or_default()
    }

    fn begin(&self) -> u32 {
        self.started.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_failure(&self, attempt: u32, err: &Error) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(AttemptRecord {
                attempt,
                category: err.category(),
                message: err.to_string(),
            });
        }
    }
}

/// Run the connect phase with the retry-once policy.
///
/// `connect` is called with the 1-based attempt number and must acquire its
/// own connection: a failed attempt never hands its lease to the next one.
pub async fn connect_with_retry<T, F, Fut>(log: &AttemptLog, connect: F) -> Result<T>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = log.begin();
    loop {
        match connect(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                log.record_failure(attempt, &err);

                let retry = policy_for(&err) == FailurePolicy::RetryOnce
                    && attempt < MAX_CONNECT_ATTEMPTS;
                if !retry {
                    return Err(err);
                }

                tracing::warn!(
                    attempt,
                    category = err.category().as_str(),
                    error = %err,
                    "connect attempt failed, retrying on a fresh connection"
                );
                tokio::time::sleep(RETRY_BACKOFF).await;
                attempt = log.begin();
            }
        }
    }
}

/// Attach `x-inferproxy-session-id` and `x-inferproxy-attempts` to a response.
pub fn attach_session_headers(headers: &mut HeaderMap, session_id: &str, attempts: u32) {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        headers.insert(SESSION_ID_HEADER, value);
    }
    if attempts > 0 {
        headers.insert(ATTEMPTS_HEADER, HeaderValue::from(attempts));
    }
}
