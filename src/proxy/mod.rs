//! HTTP proxy server module.
//!
//! This module accepts inference requests, forwards them to the upstream
//! through the connection pool and streams the responses back.

pub mod failure;
mod handlers;
pub mod health;
pub mod relay;
mod server;
pub mod session;

pub use health::{HealthMonitor, HealthState, HealthStatus, UpstreamTarget};
pub use server::{create_router, run_server, serve, AppState};
