//! TTL-gated stream candidate cache
//!
//! Candidate sets live in SQLite, one row per key plus ordered candidate rows,
//! replaced wholesale inside a transaction. Movie and episode lookups are
//! fronted here too since both decide whether a provider call is needed.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::config::Config;
use crate::db::models::StreamCacheCounts;
use crate::db::repository::streams;
use crate::error::AppResult;
use crate::models::{
    EpisodeRecord, MovieRecord, SeriesEpisodes, StreamCacheEntry, StreamCandidate, StreamKey,
};
use crate::services::shard_store::ShardStore;

/// Prune dead lock slots once the map grows past this
const LOCK_PRUNE_THRESHOLD: usize = 256;

/// Per-key async mutexes. Slots are held weakly so finished keys cost nothing.
#[derive(Clone, Default)]
struct KeyedLocks {
    slots: Arc<Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>>,
}

impl KeyedLocks {
    fn slot(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(existing) = slots.get(key).and_then(Weak::upgrade) {
            return existing;
        }

        if slots.len() >= LOCK_PRUNE_THRESHOLD {
            slots.retain(|_, slot| slot.strong_count() > 0);
        }

        let fresh = Arc::new(tokio::sync::Mutex::new(()));
        slots.insert(key.to_string(), Arc::downgrade(&fresh));
        fresh
    }

    async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        self.slot(key).lock_owned().await
    }
}

pub struct StreamCache {
    pool: SqlitePool,
    movies: ShardStore<u64, MovieRecord>,
    episodes: ShardStore<u64, EpisodeRecord>,
    series: ShardStore<u64, SeriesEpisodes>,
    refresh_locks: KeyedLocks,
}

impl StreamCache {
    pub fn new(
        pool: SqlitePool,
        movies: ShardStore<u64, MovieRecord>,
        episodes: ShardStore<u64, EpisodeRecord>,
        series: ShardStore<u64, SeriesEpisodes>,
    ) -> Self {
        Self {
            pool,
            movies,
            episodes,
            series,
            refresh_locks: KeyedLocks::default(),
        }
    }

    /// Open the movie/episode/series shard stores under the data directory
    pub async fn open(pool: SqlitePool, config: &Config) -> AppResult<Self> {
        let movies = ShardStore::open(config.movie_shard_dir(), config.shard_cache_size).await?;
        let episodes =
            ShardStore::open(config.episode_shard_dir(), config.shard_cache_size).await?;
        let series = ShardStore::open(config.series_shard_dir(), config.shard_cache_size).await?;
        Ok(Self::new(pool, movies, episodes, series))
    }

    /// Serialize refreshes of one key in-process. Hold the guard across the
    /// freshness check, the upstream fetch and the store.
    pub async fn refresh_guard(&self, key: &StreamKey) -> OwnedMutexGuard<()> {
        self.refresh_locks.acquire(&key.cache_key()).await
    }

    // ========================================================================
    // Stream candidates
    // ========================================================================

    /// Header and candidates read in one transaction, so a concurrent
    /// replace is seen entirely or not at all
    pub async fn entry(&self, key: &StreamKey) -> AppResult<Option<StreamCacheEntry>> {
        let cache_key = key.cache_key();
        let mut tx = self.pool.begin().await?;

        let Some(row) = streams::find_entry(&mut *tx, &cache_key).await? else {
            tx.commit().await?;
            return Ok(None);
        };
        let candidate_rows = streams::find_candidates(&mut *tx, &cache_key).await?;
        tx.commit().await?;

        let candidates = candidate_rows
            .iter()
            .filter_map(|c| {
                let candidate = c.to_candidate();
                if candidate.is_none() {
                    warn!(key = %cache_key, position = c.position, "Skipping cached candidate with invalid hash");
                }
                candidate
            })
            .collect();

        Ok(Some(StreamCacheEntry {
            key: row.to_key(),
            candidates,
            fetched_at: row.fetched_at(),
            unavailable: row.unavailable,
            unavailable_for: row.unavailable_for,
        }))
    }

    pub async fn is_fresh(&self, key: &StreamKey, ttl: Duration) -> AppResult<bool> {
        self.is_fresh_at(key, ttl, Utc::now()).await
    }

    pub async fn is_fresh_at(
        &self,
        key: &StreamKey,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        Ok(streams::find_entry(&self.pool, &key.cache_key())
            .await?
            .map(|row| now - row.fetched_at() <= ttl)
            .unwrap_or(false))
    }

    /// Stored candidates in order; empty when there is no entry
    pub async fn get_candidates(&self, key: &StreamKey) -> AppResult<Vec<StreamCandidate>> {
        Ok(self
            .entry(key)
            .await?
            .map(|entry| entry.candidates)
            .unwrap_or_default())
    }

    pub async fn put_candidates(
        &self,
        key: &StreamKey,
        candidates: &[StreamCandidate],
    ) -> AppResult<()> {
        self.put_candidates_at(key, candidates, Utc::now()).await
    }

    pub async fn put_candidates_at(
        &self,
        key: &StreamKey,
        candidates: &[StreamCandidate],
        fetched_at: DateTime<Utc>,
    ) -> AppResult<()> {
        streams::replace_entry(&self.pool, key, candidates, fetched_at, None).await?;
        debug!(key = %key, count = candidates.len(), "Stored stream candidates");
        Ok(())
    }

    /// Record that nothing playable was found under `preferences` (see
    /// `ResolvePreferences::fingerprint`). The candidates are kept so other
    /// preferences, or a later retry, can skip the listing call.
    pub async fn mark_unavailable(&self, key: &StreamKey, preferences: &str) -> AppResult<()> {
        let now = Utc::now();
        if !streams::mark_unavailable(&self.pool, &key.cache_key(), preferences, now).await? {
            streams::replace_entry(&self.pool, key, &[], now, Some(preferences)).await?;
        }
        debug!(key = %key, preferences, "Cached unavailable result");
        Ok(())
    }

    /// Remove entries older than `max_age`; returns the number removed
    pub async fn purge_older_than(&self, max_age: Duration) -> AppResult<u64> {
        Ok(streams::delete_older_than(&self.pool, Utc::now() - max_age).await?)
    }

    pub async fn clear(&self) -> AppResult<u64> {
        Ok(streams::delete_all(&self.pool).await?)
    }

    pub async fn counts(&self) -> AppResult<StreamCacheCounts> {
        Ok(streams::counts(&self.pool).await?)
    }

    // ========================================================================
    // Movie / episode records
    // ========================================================================

    pub async fn get_movie(&self, tmdb_id: u64) -> Option<MovieRecord> {
        self.movies.get_record(&tmdb_id).await
    }

    /// Store a movie record. An existing non-empty IMDB id is never replaced
    /// by an empty one.
    pub async fn set_movie(
        &self,
        tmdb_id: u64,
        title: &str,
        imdb_id: &str,
        year: u32,
    ) -> AppResult<MovieRecord> {
        let existing = self.movies.get_record(&tmdb_id).await;

        let imdb_id = match &existing {
            Some(current) if imdb_id.is_empty() && !current.imdb_id.is_empty() => {
                current.imdb_id.clone()
            }
            _ => imdb_id.to_string(),
        };
        let record = MovieRecord {
            tmdb_id,
            title: title.to_string(),
            imdb_id,
            year,
        };

        if existing.as_ref() != Some(&record) {
            self.movies.put_record(&tmdb_id, record.clone()).await?;
        }
        Ok(record)
    }

    pub async fn get_episode(&self, episode_id: u64) -> Option<EpisodeRecord> {
        self.episodes.get_record(&episode_id).await
    }

    /// Episodes of a series ordered by (season, episode)
    pub async fn get_episodes_for_series(&self, series_id: u64) -> Vec<EpisodeRecord> {
        let Some(index) = self.series.get_record(&series_id).await else {
            return Vec::new();
        };

        let mut episodes: Vec<EpisodeRecord> = self
            .episodes
            .lookup_many(index.episode_ids.iter())
            .await
            .into_values()
            .collect();
        episodes.sort_by_key(|e| (e.season, e.episode));
        episodes
    }

    /// Store the episodes of one series along with its series index
    pub async fn put_series_episodes(
        &self,
        series_id: u64,
        imdb_id: &str,
        episodes: Vec<EpisodeRecord>,
    ) -> AppResult<usize> {
        let mut episode_ids: Vec<u64> = episodes.iter().map(|e| e.episode_id).collect();
        episode_ids.sort_unstable();
        episode_ids.dedup();

        let written = self
            .episodes
            .put_batch(episodes.into_iter().map(|e| (e.episode_id, e)))
            .await?;

        self.series
            .put_record(
                &series_id,
                SeriesEpisodes {
                    series_id,
                    imdb_id: imdb_id.to_string(),
                    episode_ids,
                },
            )
            .await?;

        Ok(written)
    }

    pub fn movie_store(&self) -> &ShardStore<u64, MovieRecord> {
        &self.movies
    }

    pub fn episode_store(&self) -> &ShardStore<u64, EpisodeRecord> {
        &self.episodes
    }

    pub fn series_store(&self) -> &ShardStore<u64, SeriesEpisodes> {
        &self.series
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_memory_pool, run_migrations};
    use crate::models::{InfoHash, Quality};
    use tempfile::TempDir;

    async fn cache() -> (StreamCache, TempDir) {
        let pool = create_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();

        let dir = TempDir::new().unwrap();
        let movies = ShardStore::open(dir.path().join("movies"), 2).await.unwrap();
        let episodes = ShardStore::open(dir.path().join("episodes"), 2).await.unwrap();
        let series = ShardStore::open(dir.path().join("series"), 2).await.unwrap();
        (StreamCache::new(pool, movies, episodes, series), dir)
    }

    fn candidate(quality: Quality, n: u8) -> StreamCandidate {
        StreamCandidate {
            quality,
            title: format!("Release {}", n),
            hash: InfoHash::parse(&format!("{:02x}", n).repeat(20)).unwrap(),
            file_index: Some(n as u32),
            size_bytes: n as u64 * 1000,
            resolve_url: None,
        }
    }

    #[tokio::test]
    async fn test_missing_key_is_stale_and_empty() {
        let (cache, _dir) = cache().await;
        let key = StreamKey::movie("tt0111161");

        assert!(!cache.is_fresh(&key, Duration::hours(24)).await.unwrap());
        assert!(cache.get_candidates(&key).await.unwrap().is_empty());
        assert!(cache.entry(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_freshness_window() {
        let (cache, _dir) = cache().await;
        let key = StreamKey::movie("tt0111161");
        let now = Utc::now();

        cache
            .put_candidates_at(&key, &[candidate(Quality::P1080, 1)], now - Duration::hours(23))
            .await
            .unwrap();
        assert!(cache.is_fresh_at(&key, Duration::hours(24), now).await.unwrap());

        cache
            .put_candidates_at(&key, &[candidate(Quality::P1080, 1)], now - Duration::hours(25))
            .await
            .unwrap();
        assert!(!cache.is_fresh_at(&key, Duration::hours(24), now).await.unwrap());
    }

    #[tokio::test]
    async fn test_put_replaces_wholesale() {
        let (cache, _dir) = cache().await;
        let key = StreamKey::episode("tt0903747", 1, 2);

        cache
            .put_candidates(
                &key,
                &[
                    candidate(Quality::P720, 1),
                    candidate(Quality::P1080, 2),
                    candidate(Quality::P480, 3),
                ],
            )
            .await
            .unwrap();
        cache
            .put_candidates(&key, &[candidate(Quality::P2160, 9)])
            .await
            .unwrap();

        let entry = cache.entry(&key).await.unwrap().unwrap();
        assert_eq!(entry.key, key);
        assert_eq!(entry.candidates, vec![candidate(Quality::P2160, 9)]);
        assert!(!entry.unavailable);

        let counts = cache.counts().await.unwrap();
        assert_eq!(counts.entries, 1);
        assert_eq!(counts.candidates, 1);
    }

    #[tokio::test]
    async fn test_candidate_order_is_kept() {
        let (cache, _dir) = cache().await;
        let key = StreamKey::movie("tt0068646");
        let stored = vec![
            candidate(Quality::P480, 5),
            candidate(Quality::P2160, 3),
            candidate(Quality::P720, 4),
        ];

        cache.put_candidates(&key, &stored).await.unwrap();
        assert_eq!(cache.get_candidates(&key).await.unwrap(), stored);
    }

    #[tokio::test]
    async fn test_mark_unavailable() {
        let (cache, _dir) = cache().await;
        let listed = StreamKey::movie("tt0000001");
        let unknown = StreamKey::movie("tt0000002");

        cache
            .put_candidates(&listed, &[candidate(Quality::P1080, 1)])
            .await
            .unwrap();
        cache.mark_unavailable(&listed, "480p|").await.unwrap();
        cache.mark_unavailable(&unknown, "2160p|").await.unwrap();

        let entry = cache.entry(&listed).await.unwrap().unwrap();
        assert!(entry.unavailable);
        assert!(entry.is_unavailable_for("480p|"));
        assert!(!entry.is_unavailable_for("2160p|"));
        assert_eq!(entry.candidates.len(), 1);

        let entry = cache.entry(&unknown).await.unwrap().unwrap();
        assert!(entry.is_unavailable_for("2160p|"));
        assert!(entry.candidates.is_empty());

        // A later store clears the flag
        cache
            .put_candidates(&listed, &[candidate(Quality::P720, 2)])
            .await
            .unwrap();
        let entry = cache.entry(&listed).await.unwrap().unwrap();
        assert!(!entry.unavailable);
        assert_eq!(entry.unavailable_for, None);
    }

    #[tokio::test]
    async fn test_purge_and_clear() {
        let (cache, _dir) = cache().await;
        let now = Utc::now();
        let old = StreamKey::movie("tt0000010");
        let recent = StreamKey::movie("tt0000011");

        cache
            .put_candidates_at(&old, &[candidate(Quality::P720, 1)], now - Duration::days(8))
            .await
            .unwrap();
        cache
            .put_candidates_at(&recent, &[candidate(Quality::P720, 2)], now)
            .await
            .unwrap();

        assert_eq!(cache.purge_older_than(Duration::days(7)).await.unwrap(), 1);
        assert!(cache.entry(&old).await.unwrap().is_none());

        // Candidates go with their entry
        let counts = cache.counts().await.unwrap();
        assert_eq!(counts.entries, 1);
        assert_eq!(counts.candidates, 1);

        assert_eq!(cache.clear().await.unwrap(), 1);
        assert_eq!(cache.counts().await.unwrap().candidates, 0);
    }

    #[tokio::test]
    async fn test_set_movie_keeps_known_imdb_id() {
        let (cache, _dir) = cache().await;

        cache
            .set_movie(550, "Fight Club", "tt0137523", 1999)
            .await
            .unwrap();
        let record = cache.set_movie(550, "Fight Club", "", 1999).await.unwrap();
        assert_eq!(record.imdb_id, "tt0137523");
        assert_eq!(cache.get_movie(550).await.unwrap().imdb_id, "tt0137523");

        cache.set_movie(551, "Unknown", "", 2001).await.unwrap();
        let upgraded = cache.set_movie(551, "Unknown", "tt9999999", 2001).await.unwrap();
        assert_eq!(upgraded.imdb_id, "tt9999999");
    }

    #[tokio::test]
    async fn test_series_episodes_are_ordered() {
        let (cache, _dir) = cache().await;
        let episode = |episode_id, season, episode| EpisodeRecord {
            episode_id,
            series_id: 1396,
            season,
            episode,
            imdb_id: "tt0903747".to_string(),
        };

        cache
            .put_series_episodes(
                1396,
                "tt0903747",
                vec![episode(62228, 2, 1), episode(62085, 1, 1), episode(336043, 1, 2)],
            )
            .await
            .unwrap();

        let episodes = cache.get_episodes_for_series(1396).await;
        let order: Vec<_> = episodes.iter().map(|e| (e.season, e.episode)).collect();
        assert_eq!(order, vec![(1, 1), (1, 2), (2, 1)]);

        assert_eq!(cache.get_episode(62228).await.unwrap().season, 2);
        assert!(cache.get_episodes_for_series(9).await.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_guard_serializes_same_key() {
        let (cache, _dir) = cache().await;
        let key = StreamKey::movie("tt0111161");

        let guard = cache.refresh_guard(&key).await;
        let other = StreamKey::movie("tt0068646");
        // A different key is independent
        drop(cache.refresh_guard(&other).await);

        let cache = Arc::new(cache);
        let contender = {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = cache.refresh_guard(&key).await;
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }
}
