//! Playback orchestration
//!
//! stream cache → listing provider → resolver → stream cache, with TMDB ids
//! mapped to IMDB ids through the movie/episode shard caches.

use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{ContentKind, EpisodeRecord, Resolution, StreamCandidate, StreamKey};
use crate::services::resolver::{AvailabilityResolver, ResolvePreferences};
use crate::services::metrics;
use crate::services::stream_cache::StreamCache;
use crate::services::tmdb::MetadataProvider;
use crate::services::torrentio::{into_candidates, TorrentListingProvider};

#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub stream_ttl: Duration,
    pub negative_ttl: Duration,
}

impl CachePolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stream_ttl: config.stream_ttl(),
            negative_ttl: config.negative_ttl(),
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            stream_ttl: Duration::hours(24),
            negative_ttl: Duration::hours(1),
        }
    }
}

/// Result of caching every aired episode of one series
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesCacheSummary {
    pub series_id: u64,
    pub imdb_id: String,
    pub seasons: usize,
    pub episodes: usize,
    pub skipped_unaired: usize,
}

enum Lookup {
    Negative,
    Candidates(Vec<StreamCandidate>),
}

pub struct PlaybackService {
    cache: Arc<StreamCache>,
    listing: Arc<dyn TorrentListingProvider>,
    metadata: Arc<dyn MetadataProvider>,
    resolver: AvailabilityResolver,
    policy: CachePolicy,
}

impl PlaybackService {
    pub fn new(
        cache: Arc<StreamCache>,
        listing: Arc<dyn TorrentListingProvider>,
        metadata: Arc<dyn MetadataProvider>,
        resolver: AvailabilityResolver,
        policy: CachePolicy,
    ) -> Self {
        Self {
            cache,
            listing,
            metadata,
            resolver,
            policy,
        }
    }

    pub fn cache(&self) -> &StreamCache {
        &self.cache
    }

    /// Resolve one movie or episode to a playable URL.
    ///
    /// Errors only when the listing provider is unreachable and nothing is
    /// cached, or when the cache database itself fails.
    pub async fn resolve_stream(
        &self,
        key: &StreamKey,
        prefs: &ResolvePreferences,
    ) -> AppResult<Resolution> {
        let fingerprint = prefs.fingerprint();
        let candidates = match self.cached_or_listed(key, &fingerprint).await? {
            Lookup::Negative => return Ok(Resolution::Unavailable),
            Lookup::Candidates(candidates) => candidates,
        };

        let resolution = self.resolver.resolve(candidates, prefs).await;
        if resolution == Resolution::Unavailable {
            self.cache.mark_unavailable(key, &fingerprint).await?;
        }
        Ok(resolution)
    }

    /// Candidates for `key`, refreshing from the listing provider when stale.
    /// Refreshes of one key are serialized so concurrent callers share a fetch.
    ///
    /// A negative entry short-circuits only callers whose preferences
    /// `fingerprint` matches the one it was recorded under; everyone else
    /// gets the kept candidates.
    async fn cached_or_listed(&self, key: &StreamKey, fingerprint: &str) -> AppResult<Lookup> {
        let _guard = self.cache.refresh_guard(key).await;
        let now = Utc::now();

        let stale = match self.cache.entry(key).await? {
            Some(entry)
                if entry.is_unavailable_for(fingerprint)
                    && entry.is_fresh_at(now, self.policy.negative_ttl) =>
            {
                debug!(key = %key, "Negative cache hit");
                metrics::record_cache_lookup("negative");
                return Ok(Lookup::Negative);
            }
            Some(entry)
                if !entry.is_unavailable_for(fingerprint)
                    && entry.is_fresh_at(now, self.policy.stream_ttl) =>
            {
                debug!(key = %key, count = entry.candidates.len(), "Stream cache hit");
                metrics::record_cache_lookup("fresh");
                return Ok(Lookup::Candidates(entry.candidates));
            }
            other => other,
        };
        metrics::record_cache_lookup("stale");

        match self.listing.get_streams(key).await {
            Ok(listed) => {
                let candidates = into_candidates(listed);
                info!(key = %key, count = candidates.len(), "Refreshed stream candidates");
                self.cache.put_candidates(key, &candidates).await?;
                Ok(Lookup::Candidates(candidates))
            }
            Err(e) => match stale {
                Some(entry) if !entry.candidates.is_empty() => {
                    warn!(key = %key, "Listing failed, using stale candidates: {}", e);
                    Ok(Lookup::Candidates(entry.candidates))
                }
                _ => {
                    warn!(key = %key, "Listing failed: {}", e);
                    Err(AppError::Transport(e.to_string()))
                }
            },
        }
    }

    /// IMDB id for a TMDB movie, from the movie cache or the metadata provider
    async fn movie_imdb_id(&self, tmdb_id: u64) -> AppResult<Option<String>> {
        if let Some(movie) = self.cache.get_movie(tmdb_id).await {
            if !movie.imdb_id.is_empty() {
                return Ok(Some(movie.imdb_id));
            }
            // Known movie without an IMDB id yet
            let imdb_id = self
                .metadata
                .external_ids(tmdb_id, ContentKind::Movie)
                .await?;
            if let Some(imdb_id) = &imdb_id {
                self.cache
                    .set_movie(tmdb_id, &movie.title, imdb_id, movie.year)
                    .await?;
            }
            return Ok(imdb_id);
        }

        let details = self.metadata.movie_details(tmdb_id).await?;
        let record = self
            .cache
            .set_movie(tmdb_id, &details.title, &details.imdb_id, details.year)
            .await?;
        Ok(Some(record.imdb_id).filter(|id| !id.is_empty()))
    }

    pub async fn resolve_movie(
        &self,
        tmdb_id: u64,
        prefs: &ResolvePreferences,
    ) -> AppResult<Resolution> {
        let imdb_id = self
            .movie_imdb_id(tmdb_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no IMDB id for movie {}", tmdb_id)))?;

        self.resolve_stream(&StreamKey::movie(imdb_id), prefs).await
    }

    /// Episodes are resolved from the episode cache only; cache the series first
    pub async fn resolve_episode(
        &self,
        episode_id: u64,
        prefs: &ResolvePreferences,
    ) -> AppResult<Resolution> {
        let episode = self
            .cache
            .get_episode(episode_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("episode {} is not cached", episode_id)))?;

        let key = StreamKey::episode(episode.imdb_id, episode.season, episode.episode);
        self.resolve_stream(&key, prefs).await
    }

    /// Fetch every aired episode of a series and store them with the series index
    pub async fn cache_series_episodes(&self, series_id: u64) -> AppResult<SeriesCacheSummary> {
        let details = self.metadata.series_details(series_id).await?;

        let imdb_id = if details.imdb_id.is_empty() {
            self.metadata
                .external_ids(series_id, ContentKind::Series)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("no IMDB id for series {}", series_id)))?
        } else {
            details.imdb_id
        };

        let today = Utc::now().date_naive();
        let fetched = self
            .metadata
            .season_episodes(series_id, &details.season_numbers)
            .await?;
        let total = fetched.len();

        let records: Vec<EpisodeRecord> = fetched
            .into_iter()
            .filter(|ep| ep.air_date.map(|d| d <= today).unwrap_or(false))
            .map(|ep| EpisodeRecord {
                episode_id: ep.episode_id,
                series_id,
                season: ep.season,
                episode: ep.episode,
                imdb_id: imdb_id.clone(),
            })
            .collect();
        let skipped_unaired = total - records.len();

        let episodes = self
            .cache
            .put_series_episodes(series_id, &imdb_id, records)
            .await?;
        info!(series_id, episodes, skipped_unaired, "Cached series episodes");

        Ok(SeriesCacheSummary {
            series_id,
            imdb_id,
            seasons: details.season_numbers.len(),
            episodes,
            skipped_unaired,
        })
    }
}
