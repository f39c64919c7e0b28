//! Router module for inbound request routing.
//!
//! This module maps inbound paths to upstream endpoints and performs the
//! structural checks each route requires before anything is forwarded:
//! - Exact path resolution (unknown paths are 404)
//! - Required body fields (missing or empty fields are 400)

mod routes;

pub use routes::{Route, RouteTable};
