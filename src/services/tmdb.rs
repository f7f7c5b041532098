//! TMDB metadata client
//!
//! Resolves TMDB ids to IMDB ids and enumerates the episodes of a series.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use futures::future::try_join_all;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error};

use crate::config::Config;
use crate::error::{body_preview, ProviderError};
use crate::models::ContentKind;
use crate::services::metrics;

/// TMDB caps `append_to_response` at 20 sub-requests
const SEASONS_PER_REQUEST: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct MovieDetails {
    pub tmdb_id: u64,
    pub title: String,
    pub year: u32,
    pub imdb_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesDetails {
    pub series_id: u64,
    pub name: String,
    pub imdb_id: String,
    /// Regular seasons only; specials (season 0) are left out
    pub season_numbers: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeasonEpisode {
    pub episode_id: u64,
    pub season: u32,
    pub episode: u32,
    pub air_date: Option<NaiveDate>,
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// IMDB id for a TMDB movie or series; `None` when TMDB has none
    async fn external_ids(
        &self,
        tmdb_id: u64,
        kind: ContentKind,
    ) -> Result<Option<String>, ProviderError>;

    async fn movie_details(&self, tmdb_id: u64) -> Result<MovieDetails, ProviderError>;

    async fn series_details(&self, series_id: u64) -> Result<SeriesDetails, ProviderError>;

    async fn season_episodes(
        &self,
        series_id: u64,
        seasons: &[u32],
    ) -> Result<Vec<SeasonEpisode>, ProviderError>;
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct ExternalIds {
    #[serde(default)]
    imdb_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MovieResponse {
    id: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    release_date: Option<String>,
    #[serde(default)]
    external_ids: ExternalIds,
}

#[derive(Debug, Deserialize)]
struct SeasonSummary {
    season_number: u32,
}

#[derive(Debug, Deserialize)]
struct SeriesResponse {
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    seasons: Vec<SeasonSummary>,
    #[serde(default)]
    external_ids: ExternalIds,
}

#[derive(Debug, Deserialize)]
struct EpisodeResponse {
    id: u64,
    episode_number: u32,
    #[serde(default)]
    air_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SeasonResponse {
    #[serde(default)]
    episodes: Vec<EpisodeResponse>,
}

fn non_empty(id: Option<String>) -> Option<String> {
    id.filter(|s| !s.trim().is_empty())
}

fn parse_date(raw: Option<&str>) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw?, "%Y-%m-%d").ok()
}

/// Pulls `season/<n>` entries out of an `append_to_response` payload
fn episodes_from_appended(
    body: &HashMap<String, serde_json::Value>,
    seasons: &[u32],
) -> Vec<SeasonEpisode> {
    let mut episodes = Vec::new();
    for season in seasons {
        let Some(raw) = body.get(&format!("season/{}", season)) else {
            continue;
        };
        let parsed: SeasonResponse = match serde_json::from_value(raw.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("Skipping malformed season {}: {}", season, e);
                continue;
            }
        };
        episodes.extend(parsed.episodes.into_iter().map(|ep| SeasonEpisode {
            episode_id: ep.id,
            season: *season,
            episode: ep.episode_number,
            air_date: parse_date(ep.air_date.as_deref()),
        }));
    }
    episodes
}

/// TMDB v3 client
pub struct TmdbClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl TmdbClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        Self::new(
            &config.tmdb_base_url,
            &config.tmdb_api_key,
            &config.user_agent,
            Duration::from_secs(config.listing_timeout_secs),
        )
    }

    async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        path: &str,
        append: Option<&str>,
    ) -> Result<T, ProviderError> {
        metrics::record_provider_call("tmdb", endpoint);

        let mut request = self
            .http
            .get(format!("{}/{}", self.base_url, path))
            .query(&[("api_key", self.api_key.as_str())]);
        if let Some(append) = append {
            request = request.query(&[("append_to_response", append)]);
        }

        let response = request.send().await.map_err(ProviderError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Http(status.as_u16()));
        }

        let text = response.text().await.map_err(ProviderError::from)?;
        if text.is_empty() {
            return Err(ProviderError::EmptyResponse);
        }

        serde_json::from_str(&text).map_err(|e| {
            error!("Failed to parse TMDB response for '{}': {}", endpoint, e);
            debug!("Response text: {}", body_preview(&text));
            ProviderError::Parse(e.to_string())
        })
    }
}

#[async_trait]
impl MetadataProvider for TmdbClient {
    async fn external_ids(
        &self,
        tmdb_id: u64,
        kind: ContentKind,
    ) -> Result<Option<String>, ProviderError> {
        let segment = match kind {
            ContentKind::Movie => "movie",
            ContentKind::Series => "tv",
        };
        let ids: ExternalIds = self
            .get(
                "externalIds",
                &format!("{}/{}/external_ids", segment, tmdb_id),
                None,
            )
            .await?;
        Ok(non_empty(ids.imdb_id))
    }

    async fn movie_details(&self, tmdb_id: u64) -> Result<MovieDetails, ProviderError> {
        let movie: MovieResponse = self
            .get("movie", &format!("movie/{}", tmdb_id), Some("external_ids"))
            .await?;

        let year = parse_date(movie.release_date.as_deref())
            .map(|d| d.year().max(0) as u32)
            .unwrap_or(0);

        Ok(MovieDetails {
            tmdb_id: movie.id,
            title: movie.title,
            year,
            imdb_id: non_empty(movie.external_ids.imdb_id).unwrap_or_default(),
        })
    }

    async fn series_details(&self, series_id: u64) -> Result<SeriesDetails, ProviderError> {
        let series: SeriesResponse = self
            .get("tv", &format!("tv/{}", series_id), Some("external_ids"))
            .await?;

        Ok(SeriesDetails {
            series_id: series.id,
            name: series.name,
            imdb_id: non_empty(series.external_ids.imdb_id).unwrap_or_default(),
            season_numbers: series
                .seasons
                .iter()
                .map(|s| s.season_number)
                .filter(|n| *n > 0)
                .collect(),
        })
    }

    async fn season_episodes(
        &self,
        series_id: u64,
        seasons: &[u32],
    ) -> Result<Vec<SeasonEpisode>, ProviderError> {
        let path = format!("tv/{}", series_id);
        let requests = seasons.chunks(SEASONS_PER_REQUEST).map(|chunk| {
            let append = chunk
                .iter()
                .map(|n| format!("season/{}", n))
                .collect::<Vec<_>>()
                .join(",");
            let path = &path;
            async move {
                let body: HashMap<String, serde_json::Value> =
                    self.get("tvSeasons", path, Some(&append)).await?;
                Ok::<_, ProviderError>(episodes_from_appended(&body, chunk))
            }
        });

        let pages = try_join_all(requests).await?;
        Ok(pages.into_iter().flatten().collect())
    }
}
