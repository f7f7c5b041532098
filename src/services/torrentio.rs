//! Torrentio addon client
//!
//! Lists torrents for a movie or episode, configured with the debrid key so
//! that entries already cached on the account carry the `RD+` marker.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::Config;
use crate::error::ProviderError;
use crate::models::{ContentKind, InfoHash, StreamCandidate, StreamKey};
use crate::services::classifier::QualityClassifier;
use crate::services::metrics;

lazy_static! {
    static ref RESOLVE_URL: Regex =
        Regex::new(r"(?i)/resolve/realdebrid/[^/]+/([a-f0-9]{40})/[^/]*/(\d+)/(.+)$").unwrap();
}

const CACHED_MARKER: &str = "RD+";

/// Raw listing entry, before classification
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListedStream {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(rename = "infoHash", default)]
    pub info_hash: Option<String>,
    #[serde(rename = "fileIdx", default)]
    pub file_idx: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct TorrentioResponse {
    #[serde(default)]
    streams: Vec<ListedStream>,
}

#[async_trait]
pub trait TorrentListingProvider: Send + Sync {
    /// Every listed stream for `key`, unfiltered
    async fn get_streams(&self, key: &StreamKey) -> Result<Vec<ListedStream>, ProviderError>;
}

impl ListedStream {
    pub fn is_marked_cached(&self) -> bool {
        self.name.contains(CACHED_MARKER)
    }

    /// (hash, file index, file name) from the resolve URL, else from `infoHash`
    fn locate(&self) -> Option<(InfoHash, Option<u32>, Option<String>)> {
        if let Some(caps) = self.url.as_deref().and_then(|url| RESOLVE_URL.captures(url)) {
            let hash = InfoHash::parse(&caps[1])?;
            let file_idx = caps[2].parse().ok();
            let file_name = urlencoding::decode(&caps[3])
                .map(|name| name.into_owned())
                .unwrap_or_else(|_| caps[3].to_string());
            return Some((hash, file_idx, Some(file_name)));
        }

        let hash = InfoHash::parse(self.info_hash.as_deref()?)?;
        Some((hash, self.file_idx, None))
    }

    fn into_candidate(self) -> Option<StreamCandidate> {
        let (hash, file_index, file_name) = self.locate()?;
        let label = format!(
            "{} {} {}",
            self.name,
            self.title,
            file_name.as_deref().unwrap_or_default()
        );

        Some(StreamCandidate {
            quality: QualityClassifier::classify_quality(&label),
            size_bytes: QualityClassifier::parse_size_bytes(&self.title),
            title: if self.title.is_empty() {
                file_name.unwrap_or_default()
            } else {
                self.title
            },
            hash,
            file_index,
            resolve_url: self.url,
        })
    }
}

/// Keeps entries carrying the cached marker and a recognizable hash,
/// in listing order
pub fn into_candidates(streams: Vec<ListedStream>) -> Vec<StreamCandidate> {
    streams
        .into_iter()
        .filter(ListedStream::is_marked_cached)
        .filter_map(ListedStream::into_candidate)
        .collect()
}

/// Torrentio addon client
pub struct TorrentioClient {
    http: Client,
    base_url: String,
}

impl TorrentioClient {
    pub fn new(
        base_url: &str,
        providers: &str,
        debrid_token: &str,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let options = [
            format!("providers={}", providers),
            "sort=qualitysize".to_string(),
            "debridoptions=nodownloadlinks,nocatalog".to_string(),
            format!("realdebrid={}", debrid_token),
        ]
        .join("|");

        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: format!("{}/{}", base_url.trim_end_matches('/'), options),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        Self::new(
            &config.torrentio_base_url,
            &config.torrentio_providers,
            &config.rd_api_token,
            &config.user_agent,
            Duration::from_secs(config.listing_timeout_secs),
        )
    }

    fn stream_url(&self, key: &StreamKey) -> String {
        match (key.kind, key.season, key.episode) {
            (ContentKind::Series, Some(season), Some(episode)) => format!(
                "{}/stream/series/{}:{}:{}.json",
                self.base_url, key.content_id, season, episode
            ),
            _ => format!("{}/stream/movie/{}.json", self.base_url, key.content_id),
        }
    }
}

#[async_trait]
impl TorrentListingProvider for TorrentioClient {
    async fn get_streams(&self, key: &StreamKey) -> Result<Vec<ListedStream>, ProviderError> {
        debug!(key = %key, "Torrentio listing request");
        metrics::record_provider_call("torrentio", "stream");

        let response = self
            .http
            .get(self.stream_url(key))
            .send()
            .await
            .map_err(ProviderError::from)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Http(status.as_u16()));
        }

        let text = response.text().await.map_err(ProviderError::from)?;
        if text.is_empty() {
            return Err(ProviderError::EmptyResponse);
        }

        let data: TorrentioResponse =
            serde_json::from_str(&text).map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(data.streams)
    }
}
