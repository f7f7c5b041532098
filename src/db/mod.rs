//! Database module
//!
//! SQLite integration using sqlx with:
//! - Connection pool management (WAL journal)
//! - Row types with FromRow
//! - Repository functions for the stream cache

pub mod models;
pub mod pool;
pub mod repository;

// Re-export commonly used items
pub use models::{StreamCacheCounts, StreamEntryRow};
pub use pool::{create_memory_pool, create_pool, health_check, run_migrations};
