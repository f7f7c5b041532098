use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;

use crate::db;
use crate::services::shard_store::ShardManifest;
use crate::AppState;

/// Root endpoint - basic status
pub async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "StreamArr Server",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "runtime": "rust"
    }))
}

/// Stream cache stats
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamCacheStats {
    entries: i64,
    unavailable: i64,
    candidates: i64,
}

/// Last rebuilt manifest of each shard store
#[derive(Serialize)]
struct ShardStats {
    movies: Option<ShardManifest>,
    episodes: Option<ShardManifest>,
    series: Option<ShardManifest>,
    hashes: Option<ShardManifest>,
}

/// Health check response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    uptime: u64,
    database: bool,
    stream_cache: Option<StreamCacheStats>,
    shards: ShardStats,
}

/// GET /health - Advanced health check
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();

    // SQLite is critical for playback
    let database_ok = db::health_check(&state.pool).await;

    let cache = state.playback.cache();
    let stream_cache = match cache.counts().await {
        Ok(counts) => Some(StreamCacheStats {
            entries: counts.entries,
            unavailable: counts.unavailable,
            candidates: counts.candidates,
        }),
        Err(e) => {
            tracing::warn!("Failed to count stream cache entries: {}", e);
            None
        }
    };

    // Manifests are diagnostics only; missing ones do not degrade status
    let shards = ShardStats {
        movies: cache.movie_store().manifest().await,
        episodes: cache.episode_store().manifest().await,
        series: cache.series_store().manifest().await,
        hashes: state.builder.hashes().manifest().await,
    };

    let health = HealthResponse {
        status: if database_ok { "ok" } else { "unhealthy" }.to_string(),
        uptime,
        database: database_ok,
        stream_cache,
        shards,
    };

    Json(health)
}

/// GET /metrics - Prometheus metrics
pub async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                b"Internal Server Error".to_vec(),
            )
        }
    }
}

/// Readiness probe (for Kubernetes)
pub async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if db::health_check(&state.pool).await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready - database unavailable")
    }
}

/// Liveness probe (for Kubernetes)
pub async fn live() -> impl IntoResponse {
    (StatusCode::OK, "alive")
}
