//! Real-Debrid API Client
//!
//! HTTP client for the subset of the Real-Debrid REST API used to turn a
//! cached infohash into a direct download link.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::types::*;
use super::DebridProvider;
use crate::config::Config;
use crate::error::{body_preview, ProviderError};
use crate::models::InfoHash;
use crate::services::metrics;

/// Hashes per instantAvailability URL
const AVAILABILITY_CHUNK: usize = 100;

/// Check `hashes` chunk by chunk and merge the results. A failed chunk is
/// logged and skipped; the call only fails when every chunk failed.
async fn collect_availability<'a, F, Fut>(
    hashes: &'a [InfoHash],
    mut check: F,
) -> Result<AvailabilityMap, ProviderError>
where
    F: FnMut(&'a [InfoHash]) -> Fut,
    Fut: Future<Output = Result<AvailabilityMap, ProviderError>>,
{
    let mut available = AvailabilityMap::new();
    let mut last_error = None;
    let mut succeeded = 0;

    for (index, chunk) in hashes.chunks(AVAILABILITY_CHUNK).enumerate() {
        match check(chunk).await {
            Ok(found) => {
                succeeded += 1;
                available.extend(found);
            }
            Err(e) => {
                warn!(chunk = index, hashes = chunk.len(), "Availability chunk failed: {}", e);
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) if succeeded == 0 => Err(e),
        _ => Ok(available),
    }
}

/// Per-call timeouts; the batch call carries many hashes and gets the longest budget
#[derive(Debug, Clone, Copy)]
pub struct DebridTimeouts {
    pub batch: Duration,
    pub add: Duration,
    pub info: Duration,
}

impl DebridTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch: Duration::from_secs(config.batch_timeout_secs),
            add: Duration::from_secs(config.add_timeout_secs),
            info: Duration::from_secs(config.info_timeout_secs),
        }
    }
}

impl Default for DebridTimeouts {
    fn default() -> Self {
        Self {
            batch: Duration::from_secs(30),
            add: Duration::from_secs(20),
            info: Duration::from_secs(10),
        }
    }
}

/// Real-Debrid API Client
pub struct RealDebridClient {
    http: Client,
    base_url: String,
    timeouts: DebridTimeouts,
}

impl RealDebridClient {
    /// Create a new client authenticated with `token`
    pub fn new(
        base_url: &str,
        token: &str,
        user_agent: &str,
        timeouts: DebridTimeouts,
    ) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| ProviderError::Network(format!("invalid token header: {}", e)))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);

        let http = Client::builder()
            .default_headers(headers)
            .user_agent(user_agent)
            .timeout(timeouts.batch)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeouts,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        Self::new(
            &config.rd_base_url,
            &config.rd_api_token,
            &config.user_agent,
            DebridTimeouts::from_config(config),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Send and check status
    async fn send(
        &self,
        endpoint: &'static str,
        request: RequestBuilder,
    ) -> Result<Response, ProviderError> {
        debug!("Real-Debrid request: {}", endpoint);
        metrics::record_provider_call("realdebrid", endpoint);

        let response = request.send().await.map_err(ProviderError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Http(status.as_u16()));
        }
        Ok(response)
    }

    async fn json<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        request: RequestBuilder,
    ) -> Result<T, ProviderError> {
        let text = self
            .send(endpoint, request)
            .await?
            .text()
            .await
            .map_err(ProviderError::from)?;

        if text.is_empty() {
            return Err(ProviderError::EmptyResponse);
        }

        serde_json::from_str(&text).map_err(|e| {
            error!("Failed to parse Real-Debrid response for '{}': {}", endpoint, e);
            debug!("Response text: {}", body_preview(&text));
            ProviderError::Parse(e.to_string())
        })
    }

    async fn availability_chunk(&self, hashes: &[InfoHash]) -> Result<AvailabilityMap, ProviderError> {
        let path = hashes
            .iter()
            .map(InfoHash::as_str)
            .collect::<Vec<_>>()
            .join("/");
        let request = self
            .http
            .get(self.url(&format!("torrents/instantAvailability/{}", path)))
            .timeout(self.timeouts.batch);

        let body: serde_json::Value = self.json("instantAvailability", request).await?;
        Ok(parse_instant_availability(&body))
    }
}

#[async_trait]
impl DebridProvider for RealDebridClient {
    async fn instant_availability(
        &self,
        hashes: &[InfoHash],
    ) -> Result<AvailabilityMap, ProviderError> {
        collect_availability(hashes, |chunk| self.availability_chunk(chunk)).await
    }

    async fn add_magnet(&self, magnet: &str) -> Result<String, ProviderError> {
        let request = self
            .http
            .post(self.url("torrents/addMagnet"))
            .form(&[("magnet", magnet)])
            .timeout(self.timeouts.add);

        let added: AddedTorrent = self.json("addMagnet", request).await?;
        Ok(added.id)
    }

    async fn torrent_info(&self, torrent_id: &str) -> Result<TorrentInfo, ProviderError> {
        let request = self
            .http
            .get(self.url(&format!("torrents/info/{}", torrent_id)))
            .timeout(self.timeouts.info);

        self.json("torrentInfo", request).await
    }

    async fn select_files(&self, torrent_id: &str, file_ids: &[u32]) -> Result<(), ProviderError> {
        let files = file_ids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let request = self
            .http
            .post(self.url(&format!("torrents/selectFiles/{}", torrent_id)))
            .form(&[("files", files.as_str())])
            .timeout(self.timeouts.info);

        self.send("selectFiles", request).await?;
        Ok(())
    }

    async fn unrestrict_link(&self, link: &str) -> Result<String, ProviderError> {
        let request = self
            .http
            .post(self.url("unrestrict/link"))
            .form(&[("link", link)])
            .timeout(self.timeouts.add);

        let unrestricted: UnrestrictedLink = self.json("unrestrictLink", request).await?;
        if unrestricted.download.is_empty() {
            return Err(ProviderError::EmptyResponse);
        }
        Ok(unrestricted.download)
    }

    async fn delete_torrent(&self, torrent_id: &str) -> Result<(), ProviderError> {
        let request = self
            .http
            .delete(self.url(&format!("torrents/delete/{}", torrent_id)))
            .timeout(self.timeouts.info);

        self.send("deleteTorrent", request).await?;
        Ok(())
    }
}
