use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Release quality tier, ordered from worst to best
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Quality {
    #[serde(rename = "unknown")]
    Unknown,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "2160p")]
    P2160,
}

impl Quality {
    /// Ranking used by the sorter and the resolution ceiling (higher is better)
    pub fn rank(self) -> u8 {
        match self {
            Quality::Unknown => 0,
            Quality::P480 => 1,
            Quality::P720 => 2,
            Quality::P1080 => 3,
            Quality::P2160 => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Unknown => "unknown",
            Quality::P480 => "480p",
            Quality::P720 => "720p",
            Quality::P1080 => "1080p",
            Quality::P2160 => "2160p",
        }
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "2160p" | "4k" | "uhd" => Ok(Quality::P2160),
            "1080p" => Ok(Quality::P1080),
            "720p" => Ok(Quality::P720),
            "480p" => Ok(Quality::P480),
            "unknown" | "" => Ok(Quality::Unknown),
            other => Err(format!("unknown quality '{}'", other)),
        }
    }
}

/// Kind of playable content behind a stream-cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Movie,
    Series,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Movie => "movie",
            ContentKind::Series => "series",
        }
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "movie" => Ok(ContentKind::Movie),
            "series" | "tv" | "episode" => Ok(ContentKind::Series),
            other => Err(format!("unknown content kind '{}'", other)),
        }
    }
}

/// What a hash-list torrent contains, as inferred from its filename
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashType {
    Movie,
    Series,
    Episode,
}

/// TMDB episode id → series/season/episode + series IMDB id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub episode_id: u64,
    pub series_id: u64,
    pub season: u32,
    pub episode: u32,
    pub imdb_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovieRecord {
    pub tmdb_id: u64,
    pub title: String,
    pub imdb_id: String,
    pub year: u32,
}

/// Series → episode ids, so a series can be enumerated without scanning episode shards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesEpisodes {
    pub series_id: u64,
    pub imdb_id: String,
    pub episode_ids: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRecord {
    pub hash: String,
    pub filename: String,
    pub bytes: u64,
    #[serde(rename = "type")]
    pub kind: HashType,
    pub quality: Quality,
}

/// 40-char lowercase hex SHA-1 infohash
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InfoHash(String);

impl InfoHash {
    /// Normalizes case; rejects anything that is not 40 hex characters.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.len() == 40 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(trimmed.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn magnet(&self) -> String {
        format!("magnet:?xt=urn:btih:{}", self.0)
    }
}

impl std::fmt::Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One torrent that might play the requested content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamCandidate {
    pub quality: Quality,
    pub title: String,
    pub hash: InfoHash,
    /// Index of the file inside the torrent, as declared by the listing provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_index: Option<u32>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolve_url: Option<String>,
}

/// Stream-cache key: (IMDB id, kind, season?, episode?)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamKey {
    pub content_id: String,
    pub kind: ContentKind,
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

impl StreamKey {
    pub fn movie(imdb_id: impl Into<String>) -> Self {
        Self {
            content_id: imdb_id.into(),
            kind: ContentKind::Movie,
            season: None,
            episode: None,
        }
    }

    pub fn episode(imdb_id: impl Into<String>, season: u32, episode: u32) -> Self {
        Self {
            content_id: imdb_id.into(),
            kind: ContentKind::Series,
            season: Some(season),
            episode: Some(episode),
        }
    }

    /// Flat primary key for storage ("tt0111161:movie", "tt0903747:series:1:2")
    pub fn cache_key(&self) -> String {
        match (self.season, self.episode) {
            (Some(s), Some(e)) => format!("{}:{}:{}:{}", self.content_id, self.kind, s, e),
            (Some(s), None) => format!("{}:{}:{}", self.content_id, self.kind, s),
            _ => format!("{}:{}", self.content_id, self.kind),
        }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.cache_key())
    }
}

/// Cached candidate set for one key; replaced wholesale on refresh
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamCacheEntry {
    pub key: StreamKey,
    pub candidates: Vec<StreamCandidate>,
    pub fetched_at: DateTime<Utc>,
    /// Set when the last resolution found nothing playable
    pub unavailable: bool,
    /// Preferences fingerprint the negative result was recorded under
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable_for: Option<String>,
}

impl StreamCacheEntry {
    pub fn is_fresh_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.fetched_at <= ttl
    }

    /// A negative result only holds for the preferences that produced it
    pub fn is_unavailable_for(&self, preferences: &str) -> bool {
        self.unavailable && self.unavailable_for.as_deref() == Some(preferences)
    }
}

/// Outcome of a resolution request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Resolution {
    #[serde(rename = "ok", rename_all = "camelCase")]
    Playable {
        url: String,
        hash: InfoHash,
        quality: Quality,
    },
    Unavailable,
}

impl Resolution {
    pub fn url(&self) -> Option<&str> {
        match self {
            Resolution::Playable { url, .. } => Some(url),
            Resolution::Unavailable => None,
        }
    }
}
