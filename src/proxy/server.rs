//! HTTP server setup and lifecycle.

use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::health::HealthMonitor;
use crate::config::Config;
use crate::events::{EventSink, TracingSink};
use crate::router::RouteTable;
use crate::upstream::UpstreamClient;

/// How long to wait for connections to close after force-closing relays.
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(2);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub routes: Arc<RouteTable>,
    pub upstream: Arc<UpstreamClient>,
    pub health: Arc<HealthMonitor>,
    pub events: Arc<dyn EventSink>,
    pub config: Arc<Config>,
    /// Fired when the grace period ends; terminates remaining relays.
    pub force_close: CancellationToken,
}

impl AppState {
    /// Build the state from a validated config, with the default tracing sink.
    pub fn new(config: Config) -> crate::Result<Self> {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    /// Build the state with a custom event sink.
    pub fn with_sink(config: Config, events: Arc<dyn EventSink>) -> crate::Result<Self> {
        let upstream = Arc::new(UpstreamClient::new(&config.upstream, &config.health)?);
        let health = Arc::new(HealthMonitor::new(upstream.clone(), &config.health));

        Ok(Self {
            routes: Arc::new(RouteTable::new(&config.routes)),
            upstream,
            health,
            events,
            config: Arc::new(config),
            force_close: CancellationToken::new(),
        })
    }
}

/// Create the axum router with all endpoints.
///
/// Configured routes are not registered individually: every path other than
/// the health endpoints goes to [`handlers::forward`], which resolves it
/// against the route table and answers 404/405 itself.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/health/details", get(handlers::health_details))
        .fallback(handlers::forward)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve on `listener` until `shutdown` resolves, then drain.
///
/// On shutdown the listener stops accepting, the pool refuses new sessions
/// and the health loop stops. In-flight sessions get the configured grace
/// period, after which remaining relays are force-closed.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let grace = state.config.shutdown.grace_period();
    let draining = CancellationToken::new();

    let monitor = state.health.clone().spawn(draining.child_token());

    let trigger = draining.clone();
    tokio::spawn(async move {
        shutdown.await;
        trigger.cancel();
    });

    let app = create_router(state.clone());
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(draining.clone().cancelled_owned())
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result?,
        _ = draining.cancelled() => {
            let stats = state.upstream.pool_stats();
            tracing::info!(
                grace_secs = grace.as_secs(),
                in_flight = stats.leased,
                "Shutdown requested, draining in-flight sessions"
            );
            state.upstream.close();

            match tokio::time::timeout(grace, &mut server).await {
                Ok(result) => result?,
                Err(_) => {
                    tracing::warn!(
                        in_flight = state.upstream.pool_stats().leased,
                        "Grace period elapsed, force-closing remaining sessions"
                    );
                    state.force_close.cancel();
                    if tokio::time::timeout(FORCE_CLOSE_WAIT, &mut server).await.is_err() {
                        tracing::warn!("Server did not stop after force close");
                    }
                }
            }
        }
    }

    draining.cancel();
    let _ = monitor.await;
    tracing::info!("Server stopped");

    Ok(())
}

/// Run the HTTP server until SIGINT/SIGTERM.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();
    let state = AppState::new(config)?;

    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(
        address = %listen_addr,
        upstream = %state.upstream.base_url(),
        pool_size = state.config.upstream.pool_size,
        routes = state.routes.routes().len(),
        "Starting inferproxy server"
    );

    serve(listener, state, shutdown_signal()).await
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
