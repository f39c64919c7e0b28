//! inferproxy - streaming reverse proxy for a local inference backend
//!
//! This library provides the core of the proxy: configuration, routing and
//! request validation, the bounded upstream connection pool, streaming relay,
//! failure isolation and upstream health monitoring.

pub mod config;
pub mod error;
pub mod events;
pub mod proxy;
pub mod router;
pub mod upstream;

pub use config::Config;
pub use error::{Error, Result};
