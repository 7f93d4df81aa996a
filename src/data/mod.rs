//! Data layer module
//!
//! Handles all data persistence:
//! - `FederationStore` trait shared by every component
//! - SQLite store (production)
//! - In-memory store (tests, ephemeral instances)

mod database;
mod memory;
mod models;
mod store;

pub use database::SqliteStore;
pub use memory::MemoryStore;
pub use models::*;
pub use store::FederationStore;

#[cfg(test)]
mod database_test;
