//! Admin authentication
//!
//! Handles:
//! - Bearer token check for the /admin endpoints

mod middleware;

pub use middleware::Admin;
