//! Database row types for SQLite
//!
//! These types map directly to database rows and can be converted
//! to the domain types in models/media.rs

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::models::{ContentKind, InfoHash, Quality, StreamCandidate, StreamKey};

/// Stream cache entry row
#[derive(Debug, Clone, FromRow)]
pub struct StreamEntryRow {
    pub cache_key: String,
    pub content_id: String,
    pub kind: String,
    pub season: Option<i64>,
    pub episode: Option<i64>,
    /// Unix millis
    pub fetched_at: i64,
    pub unavailable: bool,
    pub unavailable_for: Option<String>,
}

impl StreamEntryRow {
    pub fn to_key(&self) -> StreamKey {
        StreamKey {
            content_id: self.content_id.clone(),
            kind: self.kind.parse().unwrap_or(ContentKind::Movie),
            season: self.season.map(|s| s as u32),
            episode: self.episode.map(|e| e as u32),
        }
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.fetched_at).unwrap_or(DateTime::UNIX_EPOCH)
    }
}

/// Stream candidate row
#[derive(Debug, Clone, FromRow)]
pub struct CandidateRow {
    pub cache_key: String,
    pub position: i64,
    pub quality: String,
    pub title: String,
    pub hash: String,
    pub file_idx: Option<i64>,
    pub size_bytes: i64,
    pub resolve_url: Option<String>,
}

impl CandidateRow {
    /// Rows carrying a hash that no longer validates are skipped by the caller.
    pub fn to_candidate(&self) -> Option<StreamCandidate> {
        Some(StreamCandidate {
            quality: self.quality.parse().unwrap_or(Quality::Unknown),
            title: self.title.clone(),
            hash: InfoHash::parse(&self.hash)?,
            file_index: self.file_idx.map(|i| i as u32),
            size_bytes: self.size_bytes.max(0) as u64,
            resolve_url: self.resolve_url.clone(),
        })
    }
}

/// Counts reported by the admin stats endpoint
#[derive(Debug, Clone, Default, FromRow)]
pub struct StreamCacheCounts {
    pub entries: i64,
    pub unavailable: i64,
    pub candidates: i64,
}
