pub mod classifier;
pub mod cleanup;
pub mod debrid;
pub mod hashlist;
pub mod metrics;
pub mod playback;
pub mod resolver;
pub mod shard_store;
pub mod stream_cache;
pub mod tasks;
pub mod tmdb;
pub mod torrentio;
