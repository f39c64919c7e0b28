//! HTTP request handlers.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use http_body_util::LengthLimitError;

use super::failure::{attach_session_headers, connect_with_retry};
use super::health::HealthState;
use super::relay::{inbound_response_headers, outbound_request_headers, relay_response, RelayBody};
use super::server::AppState;
use super::session::{ForwardingSession, SessionPhase};
use crate::error::{Error, FailureCategory};
use crate::events::Outcome;

/// A terminal failure, rendered as the structured error body.
struct RequestError {
    error: Error,
    session_id: String,
    attempts: u32,
}

impl RequestError {
    /// Finish the session with the outcome that fits `error` and wrap it.
    fn settle(session: ForwardingSession, error: Error) -> Self {
        let outcome = match error.category() {
            FailureCategory::Connect | FailureCategory::Timeout | FailureCategory::UpstreamError => {
                Outcome::Failed
            }
            _ => Outcome::Rejected,
        };
        let session_id = session.id().to_string();
        let attempts = session.attempts();

        match outcome {
            Outcome::Failed => tracing::warn!(
                session_id = %session_id,
                route = %session.route(),
                attempts,
                category = error.category().as_str(),
                error = %error,
                "forwarding failed"
            ),
            _ => tracing::debug!(
                session_id = %session_id,
                route = %session.route(),
                category = error.category().as_str(),
                error = %error,
                "request rejected"
            ),
        }

        let mut session = session;
        session.set_status(error.status_code().as_u16());
        session.finish(outcome, Some(error.category()));

        Self {
            error,
            session_id,
            attempts,
        }
    }
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let body = self.error.to_body(Some(&self.session_id));
        let mut response = (self.error.status_code(), Json(body)).into_response();
        attach_session_headers(response.headers_mut(), &self.session_id, self.attempts);
        response
    }
}

/// Forward any routed request to the upstream (router fallback).
///
/// Resolves and validates the route, runs the connect phase with the
/// retry-once policy, then hands the upstream response to a [`RelayBody`].
pub async fn forward(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let session = ForwardingSession::new(uri.path(), state.events.clone());
    tracing::debug!(
        session_id = %session.id(),
        method = %method,
        path = %uri.path(),
        "inbound request"
    );

    match forward_session(&state, session, method, &uri, headers, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn forward_session(
    state: &AppState,
    mut session: ForwardingSession,
    method: Method,
    uri: &Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, RequestError> {
    let route = match state.routes.resolve(uri.path()) {
        Ok(route) => route.clone(),
        Err(e) => return Err(RequestError::settle(session, e)),
    };
    if method != Method::POST {
        let error = Error::MethodNotAllowed {
            method: method.to_string(),
            path: uri.path().to_string(),
        };
        return Err(RequestError::settle(session, error));
    }

    let limit = state.config.server.max_body_bytes;
    let body = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let error = if is_length_limit(&e) {
                Error::BodyTooLarge { limit }
            } else {
                Error::Validation(format!("Failed to read request body: {}", e))
            };
            return Err(RequestError::settle(session, error));
        }
    };

    if let Err(e) = route.validate(&body) {
        return Err(RequestError::settle(session, e));
    }

    let upstream_target = match uri.query() {
        Some(query) => format!("{}?{}", route.upstream_path, query),
        None => route.upstream_path.clone(),
    };
    let outbound_headers = outbound_request_headers(&headers);
    let attempts = session.attempt_log();
    let session_id = session.id();

    session.enter(SessionPhase::Connecting);
    let connect = connect_with_retry(&attempts, |attempt| {
        let upstream = state.upstream.clone();
        let headers = outbound_headers.clone();
        let body = body.clone();
        let target = upstream_target.clone();
        let method = method.clone();
        async move {
            let lease = upstream.acquire().await?;
            tracing::debug!(
                session_id = %session_id,
                attempt,
                connection = lease.id(),
                upstream = %upstream.endpoint(&target),
                "sending upstream request"
            );
            match upstream.send(&lease, method, &target, headers, body).await {
                Ok(response) => Ok((lease, response)),
                Err(e) => {
                    upstream.release(lease, false);
                    Err(e)
                }
            }
        }
    });

    let connected = tokio::select! {
        result = connect => result,
        _ = state.force_close.cancelled() => Err(Error::ShuttingDown),
    };

    let (lease, upstream_response) = match connected {
        Ok(connected) => connected,
        Err(e) => {
            for failure in attempts.failures() {
                tracing::debug!(
                    session_id = %session_id,
                    attempt = failure.attempt,
                    category = failure.category.as_str(),
                    error = %failure.message,
                    "connect attempt failed"
                );
            }
            session.enter(SessionPhase::ConnectFailed);
            return Err(RequestError::settle(session, e));
        }
    };

    session.enter(SessionPhase::Connected);
    let status = upstream_response.status();
    session.set_status(status.as_u16());
    let mut response_headers = inbound_response_headers(upstream_response.headers());
    attach_session_headers(
        &mut response_headers,
        &session.id().to_string(),
        session.attempts(),
    );

    tracing::info!(
        session_id = %session.id(),
        route = %route.path,
        status = status.as_u16(),
        attempts = session.attempts(),
        "upstream responded, relaying"
    );

    session.enter(SessionPhase::Relaying);
    let relay = RelayBody::new(
        upstream_response.bytes_stream(),
        lease,
        session,
        state.config.relay.max_chunk_bytes,
        state.force_close.clone(),
    );

    Ok(relay_response(status, response_headers, relay))
}

/// Whether a body read failed because of the size limit.
fn is_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.downcast_ref::<LengthLimitError>().is_some() {
            return true;
        }
        source = e.source();
    }
    false
}

/// Handle GET /health
///
/// `OK` with 200 while the last probe was healthy, otherwise
/// `Service Unavailable` with 503. Never probes inline.
pub async fn health(State(state): State<AppState>) -> Response {
    match state.health.current_status().state {
        HealthState::Healthy => (StatusCode::OK, "OK").into_response(),
        HealthState::Degraded | HealthState::Down => {
            (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response()
        }
    }
}

/// Handle GET /health/details
pub async fn health_details(State(state): State<AppState>) -> Response {
    let status = state.health.current_status();
    let pool = state.upstream.pool_stats();

    let code = if status.state == HealthState::Healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = serde_json::json!({
        "status": status.state.as_str(),
        "upstream": state.health.target().base_url(),
        "latency_ms": status.latency.map(|l| l.as_millis() as u64),
        "last_probed": status.last_probed.map(|t| t.to_rfc3339()),
        "last_error": status.last_error,
        "pool": pool,
    });

    (code, Json(body)).into_response()
}
