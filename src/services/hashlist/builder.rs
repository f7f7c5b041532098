use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::decode::{decode_document, TorrentTriple};
use super::feed::{DocumentDescriptor, HashlistFeed};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{HashRecord, HashType, InfoHash, Quality};
use crate::services::classifier::QualityClassifier;
use crate::services::metrics;
use crate::services::shard_store::ShardStore;

/// Per-run limits
#[derive(Debug, Clone, Copy)]
pub struct BuilderPolicy {
    /// Documents decoded per run; already-processed documents do not count
    pub max_documents: usize,
    pub page_size: usize,
}

impl BuilderPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_documents: config.hashlist_max_documents,
            page_size: config.hashlist_page_size.max(1),
        }
    }
}

impl Default for BuilderPolicy {
    fn default() -> Self {
        Self {
            max_documents: 10,
            page_size: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub documents_processed: usize,
    pub documents_skipped: usize,
    pub hashes_added: usize,
    /// Documents (or listing pages) that failed, with the reason
    pub failures: Vec<String>,
}

/// Incrementally ingests hash-list documents into the hash shard store
pub struct HashIndexBuilder {
    feed: Arc<dyn HashlistFeed>,
    hashes: ShardStore<InfoHash, HashRecord>,
    marker_dir: PathBuf,
    policy: BuilderPolicy,
    /// One run at a time; a second caller waits and then skips what the first did
    run_lock: Mutex<()>,
}

impl HashIndexBuilder {
    pub async fn new(
        feed: Arc<dyn HashlistFeed>,
        hashes: ShardStore<InfoHash, HashRecord>,
        marker_dir: impl Into<PathBuf>,
        policy: BuilderPolicy,
    ) -> AppResult<Self> {
        let marker_dir = marker_dir.into();
        fs::create_dir_all(&marker_dir)
            .await
            .map_err(|e| AppError::storage(&marker_dir, e))?;

        Ok(Self {
            feed,
            hashes,
            marker_dir,
            policy,
            run_lock: Mutex::new(()),
        })
    }

    pub fn hashes(&self) -> &ShardStore<InfoHash, HashRecord> {
        &self.hashes
    }

    pub fn classify(filename: &str) -> (HashType, Quality) {
        QualityClassifier::classify(filename)
    }

    fn marker_path(&self, document: &DocumentDescriptor) -> PathBuf {
        self.marker_dir.join(document.marker_name())
    }

    pub async fn is_processed(&self, document: &DocumentDescriptor) -> bool {
        fs::try_exists(self.marker_path(document))
            .await
            .unwrap_or(false)
    }

    pub async fn list_available_documents(
        &self,
        page: usize,
    ) -> AppResult<Vec<DocumentDescriptor>> {
        let documents = self.feed.list_documents(page, self.policy.page_size).await?;
        Ok(documents.into_iter().filter(|d| d.is_document()).collect())
    }

    /// Fetch and decode one document
    pub async fn decode_document(
        &self,
        document: &DocumentDescriptor,
    ) -> AppResult<Vec<TorrentTriple>> {
        let html = self.feed.fetch_document(document).await?;
        decode_document(&html)
    }

    /// Add triples whose hash is not yet indexed. Malformed hashes are skipped.
    /// Returns the number actually added.
    pub async fn commit_new_hashes(&self, triples: &[TorrentTriple]) -> usize {
        let records: Vec<(InfoHash, HashRecord)> = triples
            .iter()
            .filter_map(|triple| {
                let hash = InfoHash::parse(&triple.hash)?;
                let (kind, quality) = Self::classify(&triple.filename);
                let record = HashRecord {
                    hash: hash.as_str().to_string(),
                    filename: triple.filename.clone(),
                    bytes: triple.bytes,
                    kind,
                    quality,
                };
                Some((hash, record))
            })
            .collect();

        let added = self.hashes.insert_absent_batch(records).await;
        metrics::record_hashes_added(added);
        added
    }

    async fn write_marker(
        &self,
        document: &DocumentDescriptor,
        triples: &[TorrentTriple],
    ) -> AppResult<()> {
        let path = self.marker_path(document);
        let body = serde_json::to_vec(triples)
            .map_err(|e| AppError::Decode(format!("marker encode: {}", e)))?;
        fs::write(&path, body)
            .await
            .map_err(|e| AppError::storage(&path, e))
    }

    /// Process up to `max_documents` unseen documents. Per-document failures
    /// are logged and counted; the run itself never fails.
    pub async fn run(&self) -> RunSummary {
        let _running = self.run_lock.lock().await;
        let mut summary = RunSummary::default();
        let mut page = 1;

        'pages: while summary.documents_processed < self.policy.max_documents {
            let documents = match self.list_available_documents(page).await {
                Ok(documents) => documents,
                Err(e) => {
                    warn!(page, "Failed to list hash-list documents: {}", e);
                    summary.failures.push(format!("listing page {}: {}", page, e));
                    break;
                }
            };
            let listed = documents.len();

            for document in documents {
                if summary.documents_processed >= self.policy.max_documents {
                    break 'pages;
                }
                if self.is_processed(&document).await {
                    summary.documents_skipped += 1;
                    continue;
                }

                summary.documents_processed += 1;
                info!(document = %document.name, "Processing hash-list document");

                let triples = match self.decode_document(&document).await {
                    Ok(triples) => triples,
                    Err(e @ AppError::Decode(_)) => {
                        // Malformed documents are marked and not retried
                        warn!(document = %document.name, "Failed to decode: {}", e);
                        summary.failures.push(format!("{}: {}", document.name, e));
                        if let Err(e) = self.write_marker(&document, &[]).await {
                            warn!(document = %document.name, "Failed to write marker: {}", e);
                        }
                        continue;
                    }
                    Err(e) => {
                        warn!(document = %document.name, "Failed to fetch: {}", e);
                        summary.failures.push(format!("{}: {}", document.name, e));
                        continue;
                    }
                };

                let added = self.commit_new_hashes(&triples).await;
                summary.hashes_added += added;
                info!(
                    document = %document.name,
                    "Found {} torrents, added {} new hashes",
                    triples.len(),
                    added
                );

                if let Err(e) = self.write_marker(&document, &triples).await {
                    warn!(document = %document.name, "Failed to write marker: {}", e);
                }
            }

            // A short page is the last one
            if listed < self.policy.page_size {
                break;
            }
            page += 1;
        }

        info!(
            "Hash-list run complete: processed {}, skipped {}, added {} hashes, {} failures",
            summary.documents_processed,
            summary.documents_skipped,
            summary.hashes_added,
            summary.failures.len()
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::services::hashlist::decode::encode_document;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FakeFeed {
        pages: Vec<Vec<DocumentDescriptor>>,
        bodies: HashMap<String, Result<String, ()>>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl HashlistFeed for FakeFeed {
        async fn list_documents(
            &self,
            page: usize,
            _per_page: usize,
        ) -> Result<Vec<DocumentDescriptor>, ProviderError> {
            Ok(self.pages.get(page - 1).cloned().unwrap_or_default())
        }

        async fn fetch_document(
            &self,
            document: &DocumentDescriptor,
        ) -> Result<String, ProviderError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            match self.bodies.get(&document.name) {
                Some(Ok(body)) => Ok(body.clone()),
                _ => Err(ProviderError::Timeout),
            }
        }
    }

    fn document_with(count: usize, offset: usize) -> String {
        let torrents: Vec<serde_json::Value> = (0..count)
            .map(|i| {
                serde_json::json!({
                    "hash": format!("{:040x}", i + offset),
                    "filename": format!("Movie.{}.1080p.mkv", i),
                    "bytes": 1000 + i,
                })
            })
            .collect();
        encode_document(&serde_json::json!({ "title": "list", "torrents": torrents }).to_string())
    }

    async fn builder(
        dir: &TempDir,
        feed: FakeFeed,
        policy: BuilderPolicy,
    ) -> (HashIndexBuilder, Arc<FakeFeed>) {
        let feed = Arc::new(feed);
        let hashes = ShardStore::open(dir.path().join("hash_shards"), 5)
            .await
            .unwrap();
        let builder = HashIndexBuilder::new(
            feed.clone(),
            hashes,
            dir.path().join("hashlists"),
            policy,
        )
        .await
        .unwrap();
        (builder, feed)
    }

    #[tokio::test]
    async fn test_reingesting_a_document_adds_nothing() {
        let dir = TempDir::new().unwrap();
        let feed = FakeFeed {
            pages: vec![vec![DocumentDescriptor::new("d.html")]],
            bodies: HashMap::from([("d.html".to_string(), Ok(document_with(50, 0)))]),
            fetches: AtomicUsize::new(0),
        };
        let (builder, feed) = builder(&dir, feed, BuilderPolicy::default()).await;

        let first = builder.run().await;
        assert_eq!(first.documents_processed, 1);
        assert_eq!(first.hashes_added, 50);
        assert!(first.failures.is_empty());

        // Marker present: document is skipped without fetching
        let second = builder.run().await;
        assert_eq!(second.documents_processed, 0);
        assert_eq!(second.documents_skipped, 1);
        assert_eq!(feed.fetches.load(Ordering::SeqCst), 1);

        // Retry after losing the marker: decoded again, nothing new
        std::fs::remove_file(dir.path().join("hashlists/d.json")).unwrap();
        let retry = builder.run().await;
        assert_eq!(retry.documents_processed, 1);
        assert_eq!(retry.hashes_added, 0);
    }

    #[tokio::test]
    async fn test_run_respects_document_cap_and_continues_past_failures() {
        let dir = TempDir::new().unwrap();
        let docs: Vec<DocumentDescriptor> = (0..5)
            .map(|i| DocumentDescriptor::new(format!("d{}.html", i)))
            .collect();
        let mut bodies = HashMap::new();
        bodies.insert("d0.html".to_string(), Err(()));
        bodies.insert("d1.html".to_string(), Ok("<html>no iframe</html>".to_string()));
        for i in 2..5 {
            bodies.insert(format!("d{}.html", i), Ok(document_with(3, i * 100)));
        }
        let mut listing = docs.clone();
        listing.push(DocumentDescriptor::new("README.md"));

        let feed = FakeFeed {
            pages: vec![listing],
            bodies,
            fetches: AtomicUsize::new(0),
        };
        let policy = BuilderPolicy {
            max_documents: 3,
            page_size: 100,
        };
        let (builder, _) = builder(&dir, feed, policy).await;

        let summary = builder.run().await;
        assert_eq!(summary.documents_processed, 3);
        assert_eq!(summary.failures.len(), 2);
        assert_eq!(summary.hashes_added, 3);

        // Transport failure is retried next run, the malformed document is not
        let next = builder.run().await;
        assert_eq!(next.documents_skipped, 2);
        assert_eq!(next.documents_processed, 3);
        assert_eq!(next.hashes_added, 6);
    }

    #[tokio::test]
    async fn test_commit_skips_invalid_and_classifies() {
        let dir = TempDir::new().unwrap();
        let feed = FakeFeed {
            pages: vec![],
            bodies: HashMap::new(),
            fetches: AtomicUsize::new(0),
        };
        let (builder, _) = builder(&dir, feed, BuilderPolicy::default()).await;

        let hash = "ABCDEF0123456789ABCDEF0123456789ABCDEF01";
        let added = builder
            .commit_new_hashes(&[
                TorrentTriple {
                    hash: hash.to_string(),
                    filename: "Show.S01E02.2160p.mkv".to_string(),
                    bytes: 42,
                },
                TorrentTriple {
                    hash: "short".to_string(),
                    filename: "x".to_string(),
                    bytes: 0,
                },
            ])
            .await;
        assert_eq!(added, 1);

        let id = InfoHash::parse(hash).unwrap();
        let record = builder.hashes.get_record(&id).await.unwrap();
        assert_eq!(record.hash, hash.to_lowercase());
        assert_eq!(record.kind, HashType::Episode);
        assert_eq!(record.quality, Quality::P2160);
    }
}
