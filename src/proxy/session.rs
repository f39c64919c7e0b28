//! Per-request forwarding session.
//!
//! A [`ForwardingSession`] follows one inbound request from routing to the
//! last relayed byte and emits exactly one [`SessionEvent`] when it ends.
//! If it is dropped without being finished (the handler future or the
//! response body was dropped because the caller went away), the drop guard
//! records it as aborted with category `client_disconnect`. The session owns
//! the [`AttemptLog`] the connect phase writes to, so an event emitted from
//! the drop guard still reports the attempts that were started.

use std::sync::Arc;

use tokio::time::Instant;
use uuid::Uuid;

use super::failure::AttemptLog;
use crate::error::FailureCategory;
use crate::events::{EventSink, Outcome, SessionEvent};

/// Lifecycle phase of a forwarding session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Init,
    Connecting,
    ConnectFailed,
    Connected,
    Relaying,
    Completed,
    Aborted,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Init => "init",
            SessionPhase::Connecting => "connecting",
            SessionPhase::ConnectFailed => "connect_failed",
            SessionPhase::Connected => "connected",
            SessionPhase::Relaying => "relaying",
            SessionPhase::Completed => "completed",
            SessionPhase::Aborted => "aborted",
        }
    }

    /// Whether the session can move from `self` to `next`.
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (Init, Connecting)
                | (Connecting, Connected)
                | (Connecting, ConnectFailed)
                | (Connected, Relaying)
                | (Relaying, Completed)
                | (Init | Connecting | Connected | Relaying, Aborted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionPhase::ConnectFailed | SessionPhase::Completed | SessionPhase::Aborted
        )
    }
}

/// State for one inbound request.
pub struct ForwardingSession {
    id: Uuid,
    route: String,
    started: Instant,
    phase: SessionPhase,
    status: Option<u16>,
    bytes_relayed: u64,
    attempts: Arc<AttemptLog>,
    events: Arc<dyn EventSink>,
    finished: bool,
}

impl ForwardingSession {
    pub fn new(route: impl Into<String>, events: Arc<dyn EventSink>) -> Self {
        Self {
            id: Uuid::new_v4(),
            route: route.into(),
            started: Instant::now(),
            phase: SessionPhase::Init,
            status: None,
            bytes_relayed: 0,
            attempts: Arc::new(AttemptLog::new()),
            events,
            finished: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Move to `next`. Illegal transitions are logged and still applied so
    /// the final event reflects what actually happened.
    pub fn enter(&mut self, next: SessionPhase) {
        if !self.phase.can_transition_to(next) {
            tracing::warn!(
                session_id = %self.id,
                from = self.phase.as_str(),
                to = next.as_str(),
                "unexpected session phase transition"
            );
        }
        self.phase = next;
    }

    /// Status sent (or about to be sent) to the caller.
    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Shared handle for the connect phase to record attempts into.
    pub fn attempt_log(&self) -> Arc<AttemptLog> {
        self.attempts.clone()
    }

    /// Connect attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.started()
    }

    pub fn add_bytes(&mut self, n: usize) {
        self.bytes_relayed += n as u64;
    }

    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed
    }

    /// End the session and emit its event.
    pub fn finish(mut self, outcome: Outcome, category: Option<FailureCategory>) {
        self.emit(outcome, category);
    }

    fn emit(&mut self, outcome: Outcome, category: Option<FailureCategory>) {
        if self.finished {
            return;
        }
        self.finished = true;

        if outcome == Outcome::Aborted && !self.phase.is_terminal() {
            self.phase = SessionPhase::Aborted;
        }

        self.events.emit(SessionEvent {
            session_id: self.id.to_string(),
            route: self.route.clone(),
            outcome,
            status: self.status,
            duration: self.started.elapsed(),
            bytes_relayed: self.bytes_relayed,
            attempts: self.attempts.started(),
            failure_category: category,
        });
    }
}

impl Drop for ForwardingSession {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(
                session_id = %self.id,
                route = %self.route,
                phase = self.phase.as_str(),
                "client disconnected, session dropped"
            );
            self.emit(Outcome::Aborted, Some(FailureCategory::ClientDisconnect));
        }
    }
}

impl std::fmt::Debug for ForwardingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingSession")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("phase", &self.phase)
            .field("status", &self.status)
            .field("bytes_relayed", &self.bytes_relayed)
            .field("attempts", &self.attempts())
            .finish()
    }
}
