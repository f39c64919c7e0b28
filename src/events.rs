//! Session events emitted by the forwarding core.
//!
//! The core does not format or persist logs itself. Every finished
//! [`ForwardingSession`](crate::proxy::session::ForwardingSession) produces
//! exactly one [`SessionEvent`], handed to an injected [`EventSink`].

use std::sync::Mutex;
use std::time::Duration;

use crate::error::FailureCategory;

/// How a forwarding session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Upstream response fully relayed to the caller.
    Completed,
    /// Rejected before any upstream contact (validation, routing, pool).
    Rejected,
    /// Connect phase failed terminally; a synthesized error was returned.
    Failed,
    /// Stream cut short after the response had started.
    Truncated,
    /// Caller went away; outbound work was cancelled.
    Aborted,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Rejected => "rejected",
            Outcome::Failed => "failed",
            Outcome::Truncated => "truncated",
            Outcome::Aborted => "aborted",
        }
    }
}

/// A finished session, ready for the sink.
///
/// All fields are owned so sinks may move the event onto other tasks.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session_id: String,
    pub route: String,
    pub outcome: Outcome,
    /// Status sent to the caller, if headers were sent.
    pub status: Option<u16>,
    pub duration: Duration,
    pub bytes_relayed: u64,
    /// Number of connect attempts made against the upstream.
    pub attempts: u32,
    pub failure_category: Option<FailureCategory>,
}

/// Destination for session events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SessionEvent);
}

/// Default sink: one structured `tracing` event per session.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: SessionEvent) {
        let duration_ms = event.duration.as_millis() as u64;
        let category = event.failure_category.map(|c| c.as_str());
        match event.outcome {
            Outcome::Completed | Outcome::Rejected | Outcome::Aborted => tracing::info!(
                session_id = %event.session_id,
                route = %event.route,
                outcome = event.outcome.as_str(),
                status = ?event.status,
                duration_ms,
                bytes = event.bytes_relayed,
                attempts = event.attempts,
                category = ?category,
                "session finished"
            ),
            Outcome::Failed | Outcome::Truncated => tracing::warn!(
                session_id = %event.session_id,
                route = %event.route,
                outcome = event.outcome.as_str(),
                status = ?event.status,
                duration_ms,
                bytes = event.bytes_relayed,
                attempts = event.attempts,
                category = ?category,
                "session failed"
            ),
        }
    }
}

/// In-memory sink that keeps every event, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<SessionEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all events received so far, in emission order.
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: SessionEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
