//! Debrid provider integration
//!
//! The resolver talks to the debrid account only through `DebridProvider`,
//! so the provider's wire format (notably the nested instantAvailability
//! payload) stays inside `types` and `client`.

pub mod client;
pub mod types;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::models::InfoHash;

pub use client::{DebridTimeouts, RealDebridClient};
pub use types::{AvailabilityMap, CachedFile, CachedVariant, TorrentFile, TorrentInfo};

#[async_trait]
pub trait DebridProvider: Send + Sync {
    /// Which of `hashes` the provider can serve without downloading
    async fn instant_availability(
        &self,
        hashes: &[InfoHash],
    ) -> Result<AvailabilityMap, ProviderError>;

    /// Add a magnet to the account; returns the torrent id
    async fn add_magnet(&self, magnet: &str) -> Result<String, ProviderError>;

    async fn torrent_info(&self, torrent_id: &str) -> Result<TorrentInfo, ProviderError>;

    async fn select_files(&self, torrent_id: &str, file_ids: &[u32]) -> Result<(), ProviderError>;

    /// Hoster link → direct download URL
    async fn unrestrict_link(&self, link: &str) -> Result<String, ProviderError>;

    async fn delete_torrent(&self, torrent_id: &str) -> Result<(), ProviderError>;
}
