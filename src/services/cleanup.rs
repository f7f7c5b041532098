//! Periodic maintenance
//!
//! Runs as background tasks on startup, then periodically.
//! - Deletes stream cache entries older than the retention window
//! - Queues scheduled hash-list builder runs

use chrono::Duration as ChronoDuration;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use crate::error::AppResult;
use crate::services::hashlist::HashIndexBuilder;
use crate::services::stream_cache::StreamCache;
use crate::services::tasks::TaskManager;

/// Configuration for the maintenance task
pub struct MaintenanceConfig {
    /// How often to run maintenance (in seconds)
    pub interval_secs: u64,
    /// Stream cache entries fetched longer ago than this are deleted
    pub stream_retention_hours: i64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,        // Run every hour
            stream_retention_hours: 168, // 7 days
        }
    }
}

/// Delete stream cache entries past the retention window.
/// Returns the number of deleted entries
pub async fn purge_stream_cache(cache: &StreamCache, retention_hours: i64) -> AppResult<u64> {
    cache
        .purge_older_than(ChronoDuration::hours(retention_hours))
        .await
}

/// Result of a maintenance cycle
#[derive(Debug, Default)]
pub struct MaintenanceResult {
    pub stream_entries_deleted: u64,
    pub errors: Vec<String>,
}

impl MaintenanceResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Run a single maintenance cycle
pub async fn run_maintenance(cache: &StreamCache, config: &MaintenanceConfig) -> MaintenanceResult {
    let mut result = MaintenanceResult::default();

    match purge_stream_cache(cache, config.stream_retention_hours).await {
        Ok(count) => {
            result.stream_entries_deleted = count;
            if count > 0 {
                tracing::info!("Maintenance: deleted {} expired stream cache entries", count);
            }
        }
        Err(e) => {
            result.errors.push(format!("Stream cache purge failed: {}", e));
            tracing::error!("Maintenance: stream cache purge failed: {}", e);
        }
    }

    result
}

/// Start the background maintenance task
///
/// Runs immediately on startup, then periodically at the configured interval.
/// This should be spawned as a background task using `tokio::spawn`.
pub async fn start_maintenance_task(cache: Arc<StreamCache>, config: MaintenanceConfig) {
    tracing::info!(
        "Starting maintenance task (interval: {}s, retention: {}h)",
        config.interval_secs,
        config.stream_retention_hours
    );

    // First tick fires immediately
    let mut interval = time::interval(Duration::from_secs(config.interval_secs.max(1)));

    loop {
        interval.tick().await;

        let result = run_maintenance(&cache, &config).await;
        if !result.is_success() {
            for error in &result.errors {
                tracing::warn!("Maintenance error: {}", error);
            }
        }
    }
}

/// Queue a hash-list builder run on the task manager
pub async fn queue_hashlist_run(
    tasks: &TaskManager,
    builder: Arc<HashIndexBuilder>,
) -> anyhow::Result<uuid::Uuid> {
    tasks
        .submit("hashlist-run", async move {
            let summary = builder.run().await;
            Ok(json!(summary))
        })
        .await
}

/// Start the hash-list schedule. A zero interval disables it.
pub async fn start_hashlist_schedule(
    builder: Arc<HashIndexBuilder>,
    tasks: TaskManager,
    interval_secs: u64,
) {
    if interval_secs == 0 {
        tracing::info!("Scheduled hash-list runs disabled");
        return;
    }
    tracing::info!("Starting hash-list schedule (interval: {}s)", interval_secs);

    let mut interval = time::interval(Duration::from_secs(interval_secs));
    loop {
        interval.tick().await;

        if let Err(e) = queue_hashlist_run(&tasks, Arc::clone(&builder)).await {
            tracing::warn!("Failed to queue scheduled hash-list run: {}", e);
        }
    }
}
