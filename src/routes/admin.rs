//! Admin/Management endpoints: background jobs, shard maintenance, cache stats

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::models::{HashRecord, InfoHash};
use crate::routes::{app_error, error_response, ApiError};
use crate::services::cleanup::queue_hashlist_run;
use crate::services::shard_store::ShardManifest;
use crate::AppState;

const DEFAULT_SEARCH_LIMIT: usize = 50;
const MAX_SEARCH_LIMIT: usize = 500;

/// Query params for admin operations
#[derive(Debug, Deserialize)]
pub struct AdminQuery {
    /// Admin key for authorization (simple protection)
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HashSearchQuery {
    pub key: Option<String>,
    pub q: String,
    pub limit: Option<usize>,
}

/// Response for queued jobs
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQueuedResponse {
    pub success: bool,
    pub task_id: Uuid,
}

/// Manifests written by a rebuild
#[derive(Serialize)]
pub struct RebuildResponse {
    pub movies: ShardManifest,
    pub episodes: ShardManifest,
    pub series: ShardManifest,
    pub hashes: ShardManifest,
}

/// Shard file count per store
#[derive(Serialize)]
pub struct ShardCounts {
    pub movies: usize,
    pub episodes: usize,
    pub series: usize,
    pub hashes: usize,
}

/// Stats response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub stream_entries: i64,
    pub unavailable_entries: i64,
    pub stream_candidates: i64,
    pub shards: ShardCounts,
    pub tasks: usize,
}

/// Validate admin key. Admin endpoints are disabled when no key is configured.
fn validate_admin_key(config: &Config, provided_key: Option<&str>) -> Result<(), ApiError> {
    let Some(admin_key) = config.admin_key.as_deref() else {
        return Err(error_response(
            StatusCode::FORBIDDEN,
            "Admin endpoints are disabled",
        ));
    };

    match provided_key {
        Some(key) if key == admin_key => Ok(()),
        _ => Err(error_response(
            StatusCode::UNAUTHORIZED,
            "Invalid or missing admin key",
        )),
    }
}

fn queue_failed(e: anyhow::Error) -> ApiError {
    tracing::error!("Failed to queue task: {:#}", e);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to queue task")
}

/// POST /api/admin/hashlists/run - Queue a hash-list builder run
pub async fn run_hashlists(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AdminQuery>,
) -> Result<impl IntoResponse, ApiError> {
    validate_admin_key(&state.config, query.key.as_deref())?;

    let task_id = queue_hashlist_run(&state.tasks, Arc::clone(&state.builder))
        .await
        .map_err(queue_failed)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TaskQueuedResponse {
            success: true,
            task_id,
        }),
    ))
}

/// POST /api/admin/series/:series_id/cache - Queue episode caching for a series
pub async fn cache_series(
    State(state): State<Arc<AppState>>,
    Path(series_id): Path<u64>,
    Query(query): Query<AdminQuery>,
) -> Result<impl IntoResponse, ApiError> {
    validate_admin_key(&state.config, query.key.as_deref())?;

    let job_state = Arc::clone(&state);
    let task_id = state
        .tasks
        .submit(format!("series-cache-{}", series_id), async move {
            let summary = job_state.playback.cache_series_episodes(series_id).await?;
            Ok(json!(summary))
        })
        .await
        .map_err(queue_failed)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TaskQueuedResponse {
            success: true,
            task_id,
        }),
    ))
}

/// GET /api/admin/series/:series_id/episodes - Cached episodes of a series
pub async fn get_series_episodes(
    State(state): State<Arc<AppState>>,
    Path(series_id): Path<u64>,
    Query(query): Query<AdminQuery>,
) -> Result<impl IntoResponse, ApiError> {
    validate_admin_key(&state.config, query.key.as_deref())?;

    let episodes = state
        .playback
        .cache()
        .get_episodes_for_series(series_id)
        .await;

    Ok(Json(json!({
        "seriesId": series_id,
        "total": episodes.len(),
        "episodes": episodes,
    })))
}

/// GET /api/admin/tasks - All tracked tasks, newest first
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AdminQuery>,
) -> Result<impl IntoResponse, ApiError> {
    validate_admin_key(&state.config, query.key.as_deref())?;
    Ok(Json(state.tasks.list().await))
}

/// GET /api/admin/tasks/:id - Status of one task
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<AdminQuery>,
) -> Result<impl IntoResponse, ApiError> {
    validate_admin_key(&state.config, query.key.as_deref())?;

    match state.tasks.status(&id).await {
        Some(record) => Ok(Json(record)),
        None => Err(error_response(StatusCode::NOT_FOUND, "Task not found")),
    }
}

/// POST /api/admin/shards/rebuild - Recompute every shard manifest
pub async fn rebuild_shards(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AdminQuery>,
) -> Result<impl IntoResponse, ApiError> {
    validate_admin_key(&state.config, query.key.as_deref())?;

    let cache = state.playback.cache();
    let response = RebuildResponse {
        movies: cache.movie_store().rebuild_index().await.map_err(app_error)?,
        episodes: cache.episode_store().rebuild_index().await.map_err(app_error)?,
        series: cache.series_store().rebuild_index().await.map_err(app_error)?,
        hashes: state.builder.hashes().rebuild_index().await.map_err(app_error)?,
    };

    tracing::info!(
        "Rebuilt shard manifests: {} movies, {} episodes, {} series, {} hashes",
        response.movies.total_records,
        response.episodes.total_records,
        response.series.total_records,
        response.hashes.total_records
    );

    Ok(Json(response))
}

/// GET /api/admin/stats - Stream cache and shard statistics
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AdminQuery>,
) -> Result<impl IntoResponse, ApiError> {
    validate_admin_key(&state.config, query.key.as_deref())?;

    let cache = state.playback.cache();
    let counts = cache.counts().await.map_err(app_error)?;

    let shards = ShardCounts {
        movies: cache.movie_store().shard_keys().await.map_err(app_error)?.len(),
        episodes: cache.episode_store().shard_keys().await.map_err(app_error)?.len(),
        series: cache.series_store().shard_keys().await.map_err(app_error)?.len(),
        hashes: state.builder.hashes().shard_keys().await.map_err(app_error)?.len(),
    };

    Ok(Json(StatsResponse {
        stream_entries: counts.entries,
        unavailable_entries: counts.unavailable,
        stream_candidates: counts.candidates,
        shards,
        tasks: state.tasks.list().await.len(),
    }))
}

/// DELETE /api/admin/streams - Clear the stream cache
pub async fn clear_streams(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AdminQuery>,
) -> Result<impl IntoResponse, ApiError> {
    validate_admin_key(&state.config, query.key.as_deref())?;

    let deleted = state.playback.cache().clear().await.map_err(app_error)?;
    tracing::info!("Cleared {} stream cache entries", deleted);

    Ok(Json(json!({
        "success": true,
        "deleted": deleted,
    })))
}

/// GET /api/admin/hashes/:hash - Look up one indexed hash
pub async fn get_hash(
    State(state): State<Arc<AppState>>,
    Path(raw_hash): Path<String>,
    Query(query): Query<AdminQuery>,
) -> Result<Json<HashRecord>, ApiError> {
    validate_admin_key(&state.config, query.key.as_deref())?;

    let hash = InfoHash::parse(&raw_hash)
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "Invalid infohash"))?;

    state
        .builder
        .hashes()
        .get_record(&hash)
        .await
        .map(Json)
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "Hash not indexed"))
}

/// GET /api/admin/hashes/search?q= - Filename search over every hash shard (slow)
pub async fn search_hashes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashSearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    validate_admin_key(&state.config, query.key.as_deref())?;

    let needle = query.q.trim().to_lowercase();
    if needle.is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "q is required"));
    }
    let limit = query
        .limit
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .clamp(1, MAX_SEARCH_LIMIT);

    let results = state
        .builder
        .hashes()
        .search(limit, |_, record| {
            record.filename.to_lowercase().contains(&needle)
        })
        .await
        .map_err(app_error)?;

    Ok(Json(json!({
        "total": results.len(),
        "results": results,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_key_validation() {
        let mut config = Config::from_env();
        config.admin_key = None;
        let (status, _) = validate_admin_key(&config, Some("anything")).unwrap_err();
        assert_eq!(status, StatusCode::FORBIDDEN);

        config.admin_key = Some("secret".to_string());
        assert!(validate_admin_key(&config, Some("secret")).is_ok());
        let (status, _) = validate_admin_key(&config, Some("wrong")).unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = validate_admin_key(&config, None).unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
