//! Availability resolver
//!
//! Turns a raw candidate list into at most one playable URL:
//! prepare, one batched availability check, the fast path over hashes the
//! provider reports cached, then a capped per-hash fallback.
//!
//! Every torrent added to the debrid account is deleted again before the
//! attempt returns. If the request is dropped mid-attempt the delete still
//! runs on a detached task.

use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult, ProviderError};
use crate::models::{Quality, Resolution, StreamCandidate};
use crate::services::classifier::QualityClassifier;
use crate::services::debrid::{AvailabilityMap, DebridProvider, TorrentFile};
use crate::services::metrics;

const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "m4v", "mov", "wmv", "ts", "webm", "mpg",
];

/// Caller's quality ceiling and exclusion rule
#[derive(Debug, Clone)]
pub struct ResolvePreferences {
    pub max_resolution: Quality,
    pub exclude: Option<Regex>,
}

impl Default for ResolvePreferences {
    fn default() -> Self {
        Self {
            max_resolution: Quality::P2160,
            exclude: None,
        }
    }
}

fn compile_exclude(pattern: &str) -> Result<Option<Regex>, regex::Error> {
    if pattern.trim().is_empty() {
        return Ok(None);
    }
    Regex::new(pattern).map(Some)
}

impl ResolvePreferences {
    pub fn from_config(config: &Config) -> AppResult<Self> {
        let max_resolution = config
            .max_resolution
            .parse()
            .map_err(AppError::Configuration)?;
        let exclude = compile_exclude(&config.exclude_pattern)
            .map_err(|e| AppError::Configuration(format!("EXCLUDE_PATTERN: {}", e)))?;

        Ok(Self {
            max_resolution,
            exclude,
        })
    }

    /// Per-request overrides. An empty exclude pattern disables exclusion.
    pub fn with_overrides(
        &self,
        max_resolution: Option<&str>,
        exclude: Option<&str>,
    ) -> AppResult<Self> {
        let max_resolution = match max_resolution {
            Some(raw) => raw.parse().map_err(AppError::InvalidInput)?,
            None => self.max_resolution,
        };
        let exclude = match exclude {
            Some(raw) => compile_exclude(raw)
                .map_err(|e| AppError::InvalidInput(format!("exclude pattern: {}", e)))?,
            None => self.exclude.clone(),
        };

        Ok(Self {
            max_resolution,
            exclude,
        })
    }

    /// Stable key for results that depend on these preferences
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}",
            self.max_resolution,
            self.exclude.as_ref().map(Regex::as_str).unwrap_or("")
        )
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Non-cached candidates tried after the fast path is exhausted
    pub fallback_attempts: usize,
    /// Budget for the detached torrent delete
    pub cleanup_timeout: Duration,
}

impl ResolverConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            fallback_attempts: config.fallback_attempts,
            cleanup_timeout: config.cleanup_timeout(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            fallback_attempts: 3,
            cleanup_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("not instantly available")]
    NotCached,
    #[error("no video file in torrent")]
    NoVideoFile,
    #[error("no links after file selection")]
    NoLinks,
}

fn is_video(path: &str) -> bool {
    path.rsplit_once('.')
        .map(|(_, ext)| VIDEO_EXTENSIONS.iter().any(|v| v.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// The declared file wins when it is a video; otherwise the largest video.
/// Provider file ids are 1-based, listing indexes 0-based.
pub fn pick_video_file(files: &[TorrentFile], declared_index: Option<u32>) -> Option<&TorrentFile> {
    if let Some(index) = declared_index {
        let declared = files
            .iter()
            .find(|f| index.checked_add(1) == Some(f.id) && is_video(&f.path));
        if declared.is_some() {
            return declared;
        }
    }

    files
        .iter()
        .filter(|f| is_video(&f.path))
        .max_by_key(|f| f.bytes)
}

/// A torrent living on the debrid account. `release` deletes it and waits;
/// dropping an unreleased lease deletes it in the background.
struct TorrentLease {
    debrid: Arc<dyn DebridProvider>,
    torrent_id: String,
    timeout: Duration,
    released: bool,
}

impl TorrentLease {
    fn new(debrid: Arc<dyn DebridProvider>, torrent_id: String, timeout: Duration) -> Self {
        Self {
            debrid,
            torrent_id,
            timeout,
            released: false,
        }
    }

    fn id(&self) -> &str {
        &self.torrent_id
    }

    fn spawn_delete(&self) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let debrid = Arc::clone(&self.debrid);
        let torrent_id = self.torrent_id.clone();
        let timeout = self.timeout;

        Some(runtime.spawn(async move {
            match tokio::time::timeout(timeout, debrid.delete_torrent(&torrent_id)).await {
                Ok(Ok(())) => debug!(torrent = %torrent_id, "Deleted torrent"),
                Ok(Err(e)) => warn!(torrent = %torrent_id, "Torrent cleanup failed: {}", e),
                Err(_) => warn!(torrent = %torrent_id, "Torrent cleanup timed out"),
            }
        }))
    }

    async fn release(mut self) {
        self.released = true;
        if let Some(handle) = self.spawn_delete() {
            if let Err(e) = handle.await {
                warn!(torrent = %self.torrent_id, "Torrent cleanup task failed: {}", e);
            }
        }
    }
}

impl Drop for TorrentLease {
    fn drop(&mut self) {
        if !self.released {
            self.spawn_delete();
        }
    }
}

pub struct AvailabilityResolver {
    debrid: Arc<dyn DebridProvider>,
    config: ResolverConfig,
}

impl AvailabilityResolver {
    pub fn new(debrid: Arc<dyn DebridProvider>, config: ResolverConfig) -> Self {
        Self { debrid, config }
    }

    /// Resolve to exactly one playable URL or `Unavailable`. Provider failures
    /// never escape: they push the request onto the next path.
    pub async fn resolve(
        &self,
        candidates: Vec<StreamCandidate>,
        prefs: &ResolvePreferences,
    ) -> Resolution {
        let sorted =
            QualityClassifier::prepare(candidates, prefs.max_resolution, prefs.exclude.as_ref());
        if sorted.is_empty() {
            debug!("No candidates left after filtering");
            metrics::record_resolution("unavailable", "none");
            return Resolution::Unavailable;
        }

        let available = self.batch_check(&sorted).await;
        debug!(
            candidates = sorted.len(),
            available = available.len(),
            "Batch availability check done"
        );

        for candidate in sorted.iter().filter(|c| available.contains_key(&c.hash)) {
            match self.attempt(candidate).await {
                Ok(url) => return Self::playable(candidate, url, "fast"),
                Err(e) => warn!(hash = %candidate.hash, "Fast path attempt failed: {}", e),
            }
        }

        let fallback = sorted
            .iter()
            .filter(|c| !available.contains_key(&c.hash))
            .take(self.config.fallback_attempts);
        for candidate in fallback {
            match self.fallback_attempt(candidate).await {
                Ok(url) => return Self::playable(candidate, url, "fallback"),
                Err(e) => debug!(hash = %candidate.hash, "Fallback attempt failed: {}", e),
            }
        }

        info!(candidates = sorted.len(), "No playable stream found");
        metrics::record_resolution("unavailable", "none");
        Resolution::Unavailable
    }

    fn playable(candidate: &StreamCandidate, url: String, path: &str) -> Resolution {
        info!(hash = %candidate.hash, quality = %candidate.quality, path, "Resolved stream");
        metrics::record_resolution("ok", path);
        Resolution::Playable {
            url,
            hash: candidate.hash.clone(),
            quality: candidate.quality,
        }
    }

    /// One call for every hash; a failed call counts as nothing available
    async fn batch_check(&self, candidates: &[StreamCandidate]) -> AvailabilityMap {
        let hashes: Vec<_> = candidates.iter().map(|c| c.hash.clone()).collect();
        match self.debrid.instant_availability(&hashes).await {
            Ok(available) => available,
            Err(e) => {
                warn!("Batch availability check failed: {}", e);
                AvailabilityMap::new()
            }
        }
    }

    async fn fallback_attempt(&self, candidate: &StreamCandidate) -> Result<String, AttemptError> {
        let single = self
            .debrid
            .instant_availability(std::slice::from_ref(&candidate.hash))
            .await?;
        if !single.contains_key(&candidate.hash) {
            return Err(AttemptError::NotCached);
        }
        self.attempt(candidate).await
    }

    /// Add, pick the video, select, unrestrict; the torrent is deleted either way
    async fn attempt(&self, candidate: &StreamCandidate) -> Result<String, AttemptError> {
        let torrent_id = self.debrid.add_magnet(&candidate.hash.magnet()).await?;
        let lease = TorrentLease::new(
            Arc::clone(&self.debrid),
            torrent_id,
            self.config.cleanup_timeout,
        );

        let result = self.unlock(lease.id(), candidate).await;
        lease.release().await;
        result
    }

    async fn unlock(
        &self,
        torrent_id: &str,
        candidate: &StreamCandidate,
    ) -> Result<String, AttemptError> {
        let info = self.debrid.torrent_info(torrent_id).await?;
        let file_id = pick_video_file(&info.files, candidate.file_index)
            .map(|f| f.id)
            .ok_or(AttemptError::NoVideoFile)?;

        self.debrid.select_files(torrent_id, &[file_id]).await?;

        let info = self.debrid.torrent_info(torrent_id).await?;
        let link = info.links.first().ok_or(AttemptError::NoLinks)?;
        Ok(self.debrid.unrestrict_link(link).await?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::InfoHash;
    use crate::services::debrid::{CachedVariant, TorrentInfo};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub(crate) fn hash(n: u8) -> InfoHash {
        InfoHash::parse(&format!("{:02x}", n).repeat(20)).unwrap()
    }

    pub(crate) fn candidate(n: u8, quality: Quality, size_bytes: u64) -> StreamCandidate {
        StreamCandidate {
            quality,
            title: format!("Release.{}.{}", n, quality),
            hash: hash(n),
            file_index: None,
            size_bytes,
            resolve_url: None,
        }
    }

    /// In-memory debrid account. `cached` hashes are reported instantly
    /// available; only `playable` hashes contain a video file.
    #[derive(Default)]
    pub(crate) struct FakeDebrid {
        pub cached: HashSet<InfoHash>,
        pub playable: HashSet<InfoHash>,
        pub fail_batch: bool,
        pub availability_calls: AtomicUsize,
        pub submitted: Mutex<Vec<Vec<InfoHash>>>,
        pub added: Mutex<Vec<(String, InfoHash)>>,
        pub deleted: Mutex<Vec<String>>,
        selected: Mutex<HashSet<String>>,
    }

    impl FakeDebrid {
        pub(crate) fn with(cached: &[u8], playable: &[u8]) -> Self {
            Self {
                cached: cached.iter().map(|n| hash(*n)).collect(),
                playable: playable.iter().map(|n| hash(*n)).collect(),
                ..Default::default()
            }
        }

        fn hash_of(&self, torrent_id: &str) -> Option<InfoHash> {
            self.added
                .lock()
                .unwrap()
                .iter()
                .find(|(id, _)| id == torrent_id)
                .map(|(_, h)| h.clone())
        }

        pub(crate) fn added_hashes(&self) -> Vec<InfoHash> {
            self.added.lock().unwrap().iter().map(|(_, h)| h.clone()).collect()
        }

        pub(crate) fn assert_all_cleaned_up(&self) {
            let mut added: Vec<String> =
                self.added.lock().unwrap().iter().map(|(id, _)| id.clone()).collect();
            let mut deleted = self.deleted.lock().unwrap().clone();
            added.sort();
            deleted.sort();
            assert_eq!(added, deleted);
        }
    }

    #[async_trait]
    impl DebridProvider for FakeDebrid {
        async fn instant_availability(
            &self,
            hashes: &[InfoHash],
        ) -> Result<AvailabilityMap, ProviderError> {
            self.availability_calls.fetch_add(1, Ordering::SeqCst);
            self.submitted.lock().unwrap().push(hashes.to_vec());
            if self.fail_batch && hashes.len() > 1 {
                return Err(ProviderError::Timeout);
            }
            Ok(hashes
                .iter()
                .filter(|h| self.cached.contains(*h))
                .map(|h| (h.clone(), vec![CachedVariant::default()]))
                .collect())
        }

        async fn add_magnet(&self, magnet: &str) -> Result<String, ProviderError> {
            let hash = magnet
                .strip_prefix("magnet:?xt=urn:btih:")
                .and_then(InfoHash::parse)
                .ok_or_else(|| ProviderError::Parse(magnet.to_string()))?;
            let mut added = self.added.lock().unwrap();
            let id = format!("T{}", added.len() + 1);
            added.push((id.clone(), hash));
            Ok(id)
        }

        async fn torrent_info(&self, torrent_id: &str) -> Result<TorrentInfo, ProviderError> {
            let hash = self.hash_of(torrent_id).ok_or(ProviderError::Http(404))?;
            let files = if self.playable.contains(&hash) {
                vec![
                    TorrentFile {
                        id: 1,
                        path: "/Sample.mkv".to_string(),
                        bytes: 10,
                        selected: 0,
                    },
                    TorrentFile {
                        id: 2,
                        path: "/Movie.mkv".to_string(),
                        bytes: 1000,
                        selected: 0,
                    },
                ]
            } else {
                vec![TorrentFile {
                    id: 1,
                    path: "/readme.txt".to_string(),
                    bytes: 1,
                    selected: 0,
                }]
            };
            let links = if self.selected.lock().unwrap().contains(torrent_id) {
                vec![format!("https://real-debrid.com/d/{}", hash)]
            } else {
                Vec::new()
            };
            Ok(TorrentInfo {
                id: torrent_id.to_string(),
                files,
                links,
                ..Default::default()
            })
        }

        async fn select_files(
            &self,
            torrent_id: &str,
            _file_ids: &[u32],
        ) -> Result<(), ProviderError> {
            self.selected.lock().unwrap().insert(torrent_id.to_string());
            Ok(())
        }

        async fn unrestrict_link(&self, link: &str) -> Result<String, ProviderError> {
            let tail = link.rsplit('/').next().unwrap_or_default();
            Ok(format!("https://download.example/{}.mkv", tail))
        }

        async fn delete_torrent(&self, torrent_id: &str) -> Result<(), ProviderError> {
            self.deleted.lock().unwrap().push(torrent_id.to_string());
            Ok(())
        }
    }

    fn resolver(fake: &Arc<FakeDebrid>) -> AvailabilityResolver {
        let debrid: Arc<dyn DebridProvider> = fake.clone();
        AvailabilityResolver::new(debrid, ResolverConfig::default())
    }

    /// Ten 1080p candidates whose sorted order matches their number
    fn ten_candidates() -> Vec<StreamCandidate> {
        (1..=10)
            .map(|n| candidate(n, Quality::P1080, 100 - n as u64))
            .collect()
    }

    #[tokio::test]
    async fn test_fast_path_returns_best_cached() {
        let fake = Arc::new(FakeDebrid::with(&[2, 3], &[2, 3]));
        let candidates = vec![
            candidate(1, Quality::P720, 500),
            candidate(2, Quality::P1080, 100),
            candidate(3, Quality::P2160, 100),
        ];

        let result = resolver(&fake)
            .resolve(candidates, &ResolvePreferences::default())
            .await;

        assert_eq!(
            result,
            Resolution::Playable {
                url: format!("https://download.example/{}.mkv", hash(3)),
                hash: hash(3),
                quality: Quality::P2160,
            }
        );
        assert_eq!(fake.availability_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fake.added_hashes(), vec![hash(3)]);
        fake.assert_all_cleaned_up();
    }

    #[tokio::test]
    async fn test_exhausted_paths_are_bounded() {
        // 2 of 10 cached, neither has a video file, the rest are not cached
        let fake = Arc::new(FakeDebrid::with(&[3, 7], &[]));

        let result = resolver(&fake)
            .resolve(ten_candidates(), &ResolvePreferences::default())
            .await;

        assert_eq!(result, Resolution::Unavailable);
        assert_eq!(fake.added_hashes(), vec![hash(3), hash(7)]);
        // One batch call plus one per fallback attempt
        assert_eq!(fake.availability_calls.load(Ordering::SeqCst), 1 + 3);
        let submitted = fake.submitted.lock().unwrap().clone();
        assert_eq!(submitted[0].len(), 10);
        assert_eq!(submitted[1..], [vec![hash(1)], vec![hash(2)], vec![hash(4)]]);
        fake.assert_all_cleaned_up();
    }

    #[tokio::test]
    async fn test_failed_batch_falls_back() {
        let mut fake = FakeDebrid::with(&[2, 5], &[2, 5]);
        fake.fail_batch = true;
        let fake = Arc::new(fake);

        let result = resolver(&fake)
            .resolve(ten_candidates(), &ResolvePreferences::default())
            .await;

        assert_eq!(
            result.url(),
            Some(format!("https://download.example/{}.mkv", hash(2)).as_str())
        );
        assert_eq!(fake.availability_calls.load(Ordering::SeqCst), 1 + 2);
        fake.assert_all_cleaned_up();
    }

    #[tokio::test]
    async fn test_fallback_cap_is_configurable() {
        let fake = Arc::new(FakeDebrid::with(&[], &[]));
        let debrid: Arc<dyn DebridProvider> = fake.clone();
        let resolver = AvailabilityResolver::new(
            debrid,
            ResolverConfig {
                fallback_attempts: 1,
                ..Default::default()
            },
        );

        let result = resolver
            .resolve(ten_candidates(), &ResolvePreferences::default())
            .await;
        assert_eq!(result, Resolution::Unavailable);
        assert_eq!(fake.availability_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_preferences_filter_before_batch() {
        let fake = Arc::new(FakeDebrid::with(&[1, 2, 3], &[1, 2, 3]));
        let mut candidates = vec![
            candidate(1, Quality::P2160, 900),
            candidate(2, Quality::P1080, 500),
            candidate(3, Quality::P1080, 400),
        ];
        candidates[1].title = "Movie.2025.REMUX.1080p".to_string();

        let prefs = ResolvePreferences::default()
            .with_overrides(Some("1080p"), Some("REMUX|CAM"))
            .unwrap();
        let result = resolver(&fake).resolve(candidates, &prefs).await;

        assert_eq!(fake.submitted.lock().unwrap()[0], vec![hash(3)]);
        assert_eq!(
            result.url(),
            Some(format!("https://download.example/{}.mkv", hash(3)).as_str())
        );
    }

    #[tokio::test]
    async fn test_empty_candidates_skip_provider() {
        let fake = Arc::new(FakeDebrid::default());
        let result = resolver(&fake)
            .resolve(Vec::new(), &ResolvePreferences::default())
            .await;
        assert_eq!(result, Resolution::Unavailable);
        assert_eq!(fake.availability_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_lease_still_deletes() {
        let fake = Arc::new(FakeDebrid::default());
        let debrid: Arc<dyn DebridProvider> = fake.clone();

        drop(TorrentLease::new(debrid, "T9".to_string(), Duration::from_secs(1)));

        for _ in 0..50 {
            if !fake.deleted.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*fake.deleted.lock().unwrap(), vec!["T9".to_string()]);
    }

    #[test]
    fn test_pick_video_file() {
        let file = |id, path: &str, bytes| TorrentFile {
            id,
            path: path.to_string(),
            bytes,
            selected: 0,
        };
        let files = vec![
            file(1, "/Show.S01E01.mkv", 700),
            file(2, "/Show.S01E02.MP4", 900),
            file(3, "/info.nfo", 5000),
        ];

        assert_eq!(pick_video_file(&files, None).map(|f| f.id), Some(2));
        assert_eq!(pick_video_file(&files, Some(0)).map(|f| f.id), Some(1));
        // Declared index pointing at a non-video falls back to the largest video
        assert_eq!(pick_video_file(&files, Some(2)).map(|f| f.id), Some(2));
        assert!(pick_video_file(&files[2..], None).is_none());
        // Out-of-range index from a listing falls back too
        assert_eq!(pick_video_file(&files, Some(u32::MAX)).map(|f| f.id), Some(2));
    }

    #[test]
    fn test_preference_fingerprint() {
        let defaults = ResolvePreferences::default();
        assert_eq!(defaults.fingerprint(), "2160p|");

        let capped = defaults.with_overrides(Some("720p"), Some("(?i)cam")).unwrap();
        assert_eq!(capped.fingerprint(), "720p|(?i)cam");
        assert_ne!(capped.fingerprint(), defaults.fingerprint());
        assert_eq!(
            capped.with_overrides(None, None).unwrap().fingerprint(),
            capped.fingerprint()
        );
    }

    #[test]
    fn test_invalid_overrides_are_rejected() {
        let prefs = ResolvePreferences::default();
        assert!(matches!(
            prefs.with_overrides(Some("8k"), None),
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            prefs.with_overrides(None, Some("(unclosed")),
            Err(AppError::InvalidInput(_))
        ));
        assert!(prefs.with_overrides(None, Some("")).unwrap().exclude.is_none());
    }
}
