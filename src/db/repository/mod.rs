//! Database repositories
//!
//! Data access functions, kept apart from the caching policy in
//! services/stream_cache.rs.

pub mod streams;
