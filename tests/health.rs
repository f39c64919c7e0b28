//! Integration tests for upstream health monitoring and the /health endpoints.
//!
//! Verifies that:
//! - Status is Down with no probe timestamp until the first probe completes
//! - A 2xx probe within the latency threshold is Healthy, a slow one Degraded
//! - Non-2xx probes and unreachable upstreams are Down
//! - The background loop flips Down and back to Healthy within an interval
//! - GET /health answers "OK"/200 only while Healthy
//! - GET /health/details reports the cached status and pool statistics

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use http::{Request, StatusCode};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use inferproxy::config::Config;
use inferproxy::proxy::{create_router, AppState, HealthState};

/// Start an upstream whose root path returns 200 while `up` is set, 500 otherwise,
/// after waiting `delay`.
async fn start_toggle_upstream(delay: Duration) -> (String, Arc<AtomicBool>) {
    use axum::{routing::get, Router};

    let up = Arc::new(AtomicBool::new(true));
    let flag = up.clone();
    let app = Router::new().route(
        "/",
        get(move || {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(delay).await;
                if flag.load(Ordering::SeqCst) {
                    (StatusCode::OK, "Ollama is running")
                } else {
                    (StatusCode::INTERNAL_SERVER_ERROR, "down")
                }
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind toggle upstream");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    (format!("http://127.0.0.1:{}", addr.port()), up)
}

fn setup_state(upstream: &str, interval_ms: u64, latency_threshold_ms: u64) -> AppState {
    let mut config = Config::default();
    config.upstream.url = upstream.to_string();
    config.health.interval_ms = interval_ms;
    config.health.probe_timeout_ms = 500;
    config.health.latency_threshold_ms = latency_threshold_ms;
    AppState::new(config).expect("build app state")
}

async fn get(app: axum::Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 65_536)
        .await
        .expect("read body");
    (status, bytes.to_vec())
}

/// Wait until the cached state equals `want`, up to `within`.
async fn wait_for_state(state: &AppState, want: HealthState, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if state.health.current_status().state == want {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    state.health.current_status().state == want
}

// ============================================================================
// Single probes
// ============================================================================

#[tokio::test]
async fn test_status_is_down_before_first_probe() {
    let (upstream, _up) = start_toggle_upstream(Duration::ZERO).await;
    let state = setup_state(&upstream, 5000, 500);

    let status = state.health.current_status();
    assert_eq!(status.state, HealthState::Down);
    assert!(status.last_probed.is_none());

    let (code, body) = get(create_router(state), "/health").await;
    assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, b"Service Unavailable");
}

#[tokio::test]
async fn test_fast_2xx_probe_is_healthy() {
    let (upstream, _up) = start_toggle_upstream(Duration::ZERO).await;
    let state = setup_state(&upstream, 5000, 500);

    let status = state.health.probe_once().await;
    assert_eq!(status.state, HealthState::Healthy);
    assert!(status.last_probed.is_some());
    assert!(status.last_error.is_none());

    let (code, body) = get(create_router(state), "/health").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body, b"OK");
}

#[tokio::test]
async fn test_slow_2xx_probe_is_degraded() {
    let (upstream, _up) = start_toggle_upstream(Duration::from_millis(150)).await;
    let state = setup_state(&upstream, 5000, 50);

    let status = state.health.probe_once().await;
    assert_eq!(status.state, HealthState::Degraded);
    assert!(status.latency.unwrap() >= Duration::from_millis(150));

    let (code, _) = get(create_router(state), "/health").await;
    assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_5xx_probe_is_down() {
    let (upstream, up) = start_toggle_upstream(Duration::ZERO).await;
    up.store(false, Ordering::SeqCst);
    let state = setup_state(&upstream, 5000, 500);

    let status = state.health.probe_once().await;
    assert_eq!(status.state, HealthState::Down);
    assert_eq!(status.last_error.as_deref(), Some("probe returned HTTP 500"));
}

#[tokio::test]
async fn test_unreachable_upstream_is_down() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let state = setup_state(&format!("http://127.0.0.1:{}", port), 5000, 500);

    let status = state.health.probe_once().await;
    assert_eq!(status.state, HealthState::Down);
    assert!(status.last_probed.is_some());
    assert!(status.last_error.is_some());
}

// ============================================================================
// Background loop
// ============================================================================

#[tokio::test]
async fn test_monitor_tracks_outage_and_recovery() {
    let (upstream, up) = start_toggle_upstream(Duration::ZERO).await;
    let state = setup_state(&upstream, 100, 500);
    let cancel = CancellationToken::new();
    let monitor = state.health.clone().spawn(cancel.clone());

    // First probe runs immediately
    assert!(wait_for_state(&state, HealthState::Healthy, Duration::from_millis(300)).await);

    up.store(false, Ordering::SeqCst);
    assert!(
        wait_for_state(&state, HealthState::Down, Duration::from_millis(300)).await,
        "outage should be visible within one probe interval"
    );

    up.store(true, Ordering::SeqCst);
    assert!(
        wait_for_state(&state, HealthState::Healthy, Duration::from_millis(300)).await,
        "recovery should be visible within one probe interval"
    );

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), monitor)
        .await
        .expect("monitor stops on cancel")
        .unwrap();
}

#[tokio::test]
async fn test_subscribers_see_transitions() {
    let (upstream, _up) = start_toggle_upstream(Duration::ZERO).await;
    let state = setup_state(&upstream, 100, 500);
    let mut rx = state.health.target().subscribe();
    let cancel = CancellationToken::new();
    let _monitor = state.health.clone().spawn(cancel.clone());

    tokio::time::timeout(Duration::from_secs(1), rx.changed())
        .await
        .expect("first probe publishes")
        .unwrap();
    assert_eq!(rx.borrow().state, HealthState::Healthy);
    cancel.cancel();
}

// ============================================================================
// /health/details
// ============================================================================

#[tokio::test]
async fn test_health_details_reports_status_and_pool() {
    let (upstream, _up) = start_toggle_upstream(Duration::ZERO).await;
    let state = setup_state(&upstream, 5000, 500);
    state.health.probe_once().await;

    let (code, body) = get(create_router(state), "/health/details").await;
    assert_eq!(code, StatusCode::OK);

    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["upstream"], upstream.as_str());
    assert!(json["latency_ms"].is_u64());
    assert!(json["last_probed"].is_string());
    assert!(json["last_error"].is_null());
    assert_eq!(json["pool"]["max_size"], 16);
    assert_eq!(json["pool"]["leased"], 0);
}

#[tokio::test]
async fn test_health_details_unprobed_is_503() {
    let (upstream, _up) = start_toggle_upstream(Duration::ZERO).await;
    let state = setup_state(&upstream, 5000, 500);

    let (code, body) = get(create_router(state), "/health/details").await;
    assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);

    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "down");
    assert!(json["last_probed"].is_null());
}
