//! Shard-partitioned key → record storage
//!
//! Each record lives in exactly one `shard_<key>.json` file, chosen from a
//! two-character prefix of its id, so a lookup loads a single bounded file.
//! Writes replace a shard atomically (write to `.tmp`, then rename); readers
//! never take a lock and see either the old or the new shard.

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, AppResult};
use crate::models::InfoHash;

const MANIFEST_FILE: &str = "index.json";
const SHARD_KEY_LEN: usize = 2;

/// Maps a record id to its shard and to its key inside the shard
pub trait ShardId {
    fn shard_key(&self) -> String;
    fn record_key(&self) -> String;
}

impl ShardId for u64 {
    /// Leading two digits of the decimal id, zero-padded for ids below 10 (62228 → "62")
    fn shard_key(&self) -> String {
        let padded = format!("{:0width$}", self, width = SHARD_KEY_LEN);
        padded[..SHARD_KEY_LEN].to_string()
    }

    fn record_key(&self) -> String {
        self.to_string()
    }
}

impl ShardId for InfoHash {
    fn shard_key(&self) -> String {
        self.as_str()[..SHARD_KEY_LEN].to_string()
    }

    fn record_key(&self) -> String {
        self.as_str().to_string()
    }
}

/// Diagnostic manifest written by `rebuild_index`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardManifest {
    pub total_records: usize,
    pub total_shards: usize,
    pub shards: Vec<String>,
    pub created_at: DateTime<Utc>,
}

type Shard<R> = Arc<HashMap<String, R>>;

/// Recently used decoded shards plus a per-shard write counter. A disk read
/// is only cached if no write landed on that shard while it was in flight.
struct ShardCache<R> {
    shards: LruCache<String, Shard<R>>,
    generations: HashMap<String, u64>,
}

impl<R> ShardCache<R> {
    fn generation(&self, shard_key: &str) -> u64 {
        self.generations.get(shard_key).copied().unwrap_or(0)
    }
}

pub struct ShardStore<K, R> {
    dir: PathBuf,
    /// Replaced on every write
    cache: Arc<Mutex<ShardCache<R>>>,
    /// Serializes load-merge-store cycles per shard
    write_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    _id: PhantomData<fn(K)>,
}

impl<K, R> Clone for ShardStore<K, R> {
    fn clone(&self) -> Self {
        Self {
            dir: self.dir.clone(),
            cache: Arc::clone(&self.cache),
            write_locks: Arc::clone(&self.write_locks),
            _id: PhantomData,
        }
    }
}

impl<K, R> ShardStore<K, R>
where
    K: ShardId,
    R: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Open (and create if missing) a shard directory
    pub async fn open(dir: impl Into<PathBuf>, cache_size: usize) -> AppResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| AppError::storage(&dir, e))?;

        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            dir,
            cache: Arc::new(Mutex::new(ShardCache {
                shards: LruCache::new(capacity),
                generations: HashMap::new(),
            })),
            write_locks: Arc::new(Mutex::new(HashMap::new())),
            _id: PhantomData,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn shard_path(&self, shard_key: &str) -> PathBuf {
        self.dir.join(format!("shard_{}.json", shard_key))
    }

    fn shard_tmp_path(&self, shard_key: &str) -> PathBuf {
        self.dir.join(format!("shard_{}.json.tmp", shard_key))
    }

    fn write_lock(&self, shard_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.write_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(shard_key.to_string()).or_default())
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, ShardCache<R>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cache a freshly written shard and invalidate reads still in flight
    fn remember(&self, shard_key: &str, shard: Shard<R>) {
        let mut cache = self.lock_cache();
        *cache.generations.entry(shard_key.to_string()).or_default() += 1;
        cache.shards.put(shard_key.to_string(), shard);
    }

    /// Cache a shard read that started at `generation`. A read overtaken by a
    /// write is returned to the caller but not cached.
    fn admit(&self, shard_key: &str, generation: u64, shard: Shard<R>) -> Shard<R> {
        let mut cache = self.lock_cache();
        if cache.generation(shard_key) == generation {
            return Arc::clone(cache.shards.get_or_insert(shard_key.to_string(), || shard));
        }
        cache.shards.get(shard_key).cloned().unwrap_or(shard)
    }

    /// Read a shard from disk. Missing, unreadable or corrupt shards are empty.
    async fn read_shard_file(&self, shard_key: &str) -> HashMap<String, R> {
        let path = self.shard_path(shard_key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return HashMap::new(),
            Err(e) => {
                tracing::warn!(shard = %shard_key, "Failed to read shard {}: {}", path.display(), e);
                return HashMap::new();
            }
        };

        match serde_json::from_slice::<HashMap<String, R>>(&bytes) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(shard = %shard_key, "Corrupt shard {}: {}", path.display(), e);
                HashMap::new()
            }
        }
    }

    async fn load_shard(&self, shard_key: &str) -> Shard<R> {
        let generation = {
            let mut cache = self.lock_cache();
            if let Some(shard) = cache.shards.get(shard_key) {
                return Arc::clone(shard);
            }
            cache.generation(shard_key)
        };
        let shard = Arc::new(self.read_shard_file(shard_key).await);
        self.admit(shard_key, generation, shard)
    }

    /// Atomic replace: write `.tmp`, fsync, rename over the live file
    async fn store_shard(&self, shard_key: &str, records: HashMap<String, R>) -> AppResult<()> {
        let path = self.shard_path(shard_key);
        let tmp_path = self.shard_tmp_path(shard_key);

        let body = serde_json::to_vec(&records)
            .map_err(|e| AppError::Decode(format!("shard {} encode: {}", shard_key, e)))?;

        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| AppError::storage(&tmp_path, e))?;
        file.write_all(&body)
            .await
            .map_err(|e| AppError::storage(&tmp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| AppError::storage(&tmp_path, e))?;
        drop(file);

        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| AppError::storage(&path, e))?;

        self.remember(shard_key, Arc::new(records));
        Ok(())
    }

    /// Insert or overwrite one record
    pub async fn put_record(&self, id: &K, record: R) -> AppResult<()> {
        let shard_key = id.shard_key();
        let lock = self.write_lock(&shard_key);
        let _guard = lock.lock().await;

        let mut records = self.read_shard_file(&shard_key).await;
        records.insert(id.record_key(), record);
        self.store_shard(&shard_key, records).await
    }

    /// Look up one record, loading only its shard
    pub async fn get_record(&self, id: &K) -> Option<R> {
        let shard_key = id.shard_key();
        self.load_shard(&shard_key)
            .await
            .get(&id.record_key())
            .cloned()
    }

    pub async fn contains(&self, id: &K) -> bool {
        let shard_key = id.shard_key();
        self.load_shard(&shard_key)
            .await
            .contains_key(&id.record_key())
    }

    /// Batch lookup; each distinct shard is loaded once
    pub async fn lookup_many<'a, I>(&self, ids: I) -> HashMap<String, R>
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        let mut by_shard: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for id in ids {
            by_shard
                .entry(id.shard_key())
                .or_default()
                .push(id.record_key());
        }

        let mut found = HashMap::new();
        for (shard_key, keys) in by_shard {
            let shard = self.load_shard(&shard_key).await;
            for key in keys {
                if let Some(record) = shard.get(&key) {
                    found.insert(key, record.clone());
                }
            }
        }
        found
    }

    fn group_by_shard(
        records: impl IntoIterator<Item = (K, R)>,
    ) -> BTreeMap<String, Vec<(String, R)>> {
        let mut grouped: BTreeMap<String, Vec<(String, R)>> = BTreeMap::new();
        for (id, record) in records {
            grouped
                .entry(id.shard_key())
                .or_default()
                .push((id.record_key(), record));
        }
        grouped
    }

    /// Insert or overwrite many records: one load-merge-store cycle per shard.
    /// Returns the number of records written.
    pub async fn put_batch(&self, records: impl IntoIterator<Item = (K, R)>) -> AppResult<usize> {
        let mut written = 0;
        for (shard_key, entries) in Self::group_by_shard(records) {
            let lock = self.write_lock(&shard_key);
            let _guard = lock.lock().await;

            let mut shard = self.read_shard_file(&shard_key).await;
            written += entries.len();
            shard.extend(entries);
            self.store_shard(&shard_key, shard).await?;
        }
        Ok(written)
    }

    /// Insert records whose id is not already present; existing records are
    /// left untouched. A shard that fails to store is retried once, then
    /// logged and dropped. Returns the number of records newly added.
    pub async fn insert_absent_batch(&self, records: impl IntoIterator<Item = (K, R)>) -> usize {
        let mut added = 0;
        for (shard_key, entries) in Self::group_by_shard(records) {
            let lock = self.write_lock(&shard_key);
            let _guard = lock.lock().await;

            let mut shard = self.read_shard_file(&shard_key).await;
            let mut new_in_shard = 0;
            for (key, record) in entries {
                if !shard.contains_key(&key) {
                    shard.insert(key, record);
                    new_in_shard += 1;
                }
            }
            if new_in_shard == 0 {
                continue;
            }

            let stored = match self.store_shard(&shard_key, shard.clone()).await {
                Ok(()) => true,
                Err(first) => {
                    tracing::warn!(shard = %shard_key, "Shard write failed, retrying: {}", first);
                    match self.store_shard(&shard_key, shard).await {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::warn!(
                                shard = %shard_key,
                                "Dropping {} records after failed retry: {}",
                                new_in_shard,
                                e
                            );
                            false
                        }
                    }
                }
            };
            if stored {
                added += new_in_shard;
            }
        }
        added
    }

    /// Shard keys present on disk, sorted
    pub async fn shard_keys(&self) -> AppResult<Vec<String>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| AppError::storage(&self.dir, e))?;

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::storage(&self.dir, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(key) = name
                .strip_prefix("shard_")
                .and_then(|rest| rest.strip_suffix(".json"))
            {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Recompute and persist the manifest
    pub async fn rebuild_index(&self) -> AppResult<ShardManifest> {
        let shards = self.shard_keys().await?;
        let mut total_records = 0;
        for key in &shards {
            total_records += self.read_shard_file(key).await.len();
        }

        let manifest = ShardManifest {
            total_records,
            total_shards: shards.len(),
            shards,
            created_at: Utc::now(),
        };

        let path = self.dir.join(MANIFEST_FILE);
        let tmp_path = self.dir.join(format!("{}.tmp", MANIFEST_FILE));
        let body = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| AppError::Decode(format!("manifest encode: {}", e)))?;
        fs::write(&tmp_path, body)
            .await
            .map_err(|e| AppError::storage(&tmp_path, e))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| AppError::storage(&path, e))?;

        tracing::info!(
            dir = %self.dir.display(),
            "Shard manifest rebuilt: {} records in {} shards",
            manifest.total_records,
            manifest.total_shards
        );
        Ok(manifest)
    }

    /// Last written manifest, if any
    pub async fn manifest(&self) -> Option<ShardManifest> {
        let bytes = fs::read(self.dir.join(MANIFEST_FILE)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Full scan over every shard; diagnostics only
    pub async fn search<F>(&self, limit: usize, mut predicate: F) -> AppResult<Vec<R>>
    where
        F: FnMut(&str, &R) -> bool,
    {
        let mut results = Vec::new();
        for key in self.shard_keys().await? {
            let shard = self.read_shard_file(&key).await;
            let mut ids: Vec<&String> = shard.keys().collect();
            ids.sort();
            for id in ids {
                if results.len() >= limit {
                    return Ok(results);
                }
                if let Some(record) = shard.get(id) {
                    if predicate(id, record) {
                        results.push(record.clone());
                    }
                }
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EpisodeRecord;
    use tempfile::TempDir;

    fn episode(id: u64) -> EpisodeRecord {
        EpisodeRecord {
            episode_id: id,
            series_id: 1396,
            season: 1,
            episode: (id % 20) as u32,
            imdb_id: "tt0903747".to_string(),
        }
    }

    async fn store(dir: &TempDir) -> ShardStore<u64, EpisodeRecord> {
        ShardStore::open(dir.path().join("episodes"), 2).await.unwrap()
    }

    #[test]
    fn test_shard_key_uses_padded_prefix() {
        assert_eq!(62228u64.shard_key(), "62");
        assert_eq!(336043u64.shard_key(), "33");
        assert_eq!(7u64.shard_key(), "07");
        assert_eq!(12345678u64.shard_key(), "12");

        let hash = InfoHash::parse("AB00000000000000000000000000000000000001").unwrap();
        assert_eq!(hash.shard_key(), "ab");
    }

    #[tokio::test]
    async fn test_put_then_get_returns_record() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store.put_record(&62228, episode(62228)).await.unwrap();
        store.put_record(&336043, episode(336043)).await.unwrap();

        assert_eq!(store.get_record(&62228).await, Some(episode(62228)));
        assert_eq!(store.get_record(&336043).await, Some(episode(336043)));
        assert_eq!(store.get_record(&99999).await, None);
        assert!(dir.path().join("episodes/shard_62.json").exists());
        assert!(!dir.path().join("episodes/shard_62.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_read_overtaken_by_write_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store.put_record(&62228, episode(62228)).await.unwrap();

        // A reader misses the cache and reads the old file...
        store.lock_cache().shards.clear();
        let generation = store.lock_cache().generation("62");
        let stale = Arc::new(store.read_shard_file("62").await);

        // ...while a writer replaces the shard and its copy gets evicted
        let mut renamed = episode(62228);
        renamed.imdb_id = "tt9999999".to_string();
        store.put_record(&62228, renamed.clone()).await.unwrap();
        store.lock_cache().shards.clear();

        let returned = store.admit("62", generation, stale);
        assert_eq!(returned.get("62228"), Some(&episode(62228)));
        assert_eq!(store.get_record(&62228).await, Some(renamed));
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        store(&dir)
            .await
            .put_record(&62228, episode(62228))
            .await
            .unwrap();

        let reopened = store(&dir).await;
        assert_eq!(reopened.get_record(&62228).await, Some(episode(62228)));
    }

    #[tokio::test]
    async fn test_corrupt_shard_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        std::fs::write(dir.path().join("episodes/shard_62.json"), b"{not json").unwrap();

        assert_eq!(store.get_record(&62228).await, None);

        // Writing over a corrupt shard recovers it
        store.put_record(&62228, episode(62228)).await.unwrap();
        assert_eq!(store.get_record(&62228).await, Some(episode(62228)));
    }

    #[tokio::test]
    async fn test_put_batch_groups_by_shard() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let ids = [62228u64, 62999, 336043, 1, 2];
        let written = store
            .put_batch(ids.iter().map(|id| (*id, episode(*id))))
            .await
            .unwrap();
        assert_eq!(written, 5);
        assert_eq!(
            store.shard_keys().await.unwrap(),
            vec!["01", "02", "33", "62"]
        );

        let found = store.lookup_many(ids.iter()).await;
        assert_eq!(found.len(), 5);
        assert_eq!(found.get("62999"), Some(&episode(62999)));
    }

    #[tokio::test]
    async fn test_insert_absent_skips_existing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let mut original = episode(62228);
        original.imdb_id = "tt-original".to_string();
        store.put_record(&62228, original.clone()).await.unwrap();

        let added = store
            .insert_absent_batch(vec![(62228, episode(62228)), (62229, episode(62229))])
            .await;

        assert_eq!(added, 1);
        assert_eq!(store.get_record(&62228).await, Some(original));
    }

    #[tokio::test]
    async fn test_rebuild_index_counts_all_shards() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store
            .put_batch((1..=30u64).map(|i| (i * 100_000, episode(i * 100_000))))
            .await
            .unwrap();

        let manifest = store.rebuild_index().await.unwrap();
        assert_eq!(manifest.total_records, 30);
        assert_eq!(manifest.total_shards, manifest.shards.len());
        assert_eq!(store.manifest().await, Some(manifest));
    }

    #[tokio::test]
    async fn test_search_respects_limit() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store
            .put_batch((1..=10u64).map(|i| (i, episode(i))))
            .await
            .unwrap();

        let hits = store.search(3, |_, r| r.season == 1).await.unwrap();
        assert_eq!(hits.len(), 3);
    }
}
