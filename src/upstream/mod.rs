//! Upstream connection management.
//!
//! Owns everything that talks to the inference backend:
//! - Bounded connection pool with lazy idle eviction (`pool`)
//! - Request sending and error classification (`client`)
//! - Liveness probing on a client independent of the pool

mod client;
mod pool;

pub use client::{classify_send_error, classify_stream_error, ProbeOutcome, UpstreamClient};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
