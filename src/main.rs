mod config;
mod db;
mod error;
mod models;
mod routes;
mod services;

use axum::{
    routing::{delete, get, post},
    Router,
};
use sqlx::SqlitePool;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::{create_pool, run_migrations};
use crate::error::AppError;
use crate::services::{
    cleanup::{start_hashlist_schedule, start_maintenance_task, MaintenanceConfig},
    debrid::RealDebridClient,
    hashlist::{BuilderPolicy, GithubHashlistFeed, HashIndexBuilder},
    playback::{CachePolicy, PlaybackService},
    resolver::{AvailabilityResolver, ResolvePreferences, ResolverConfig},
    shard_store::ShardStore,
    stream_cache::StreamCache,
    tasks::TaskManager,
    tmdb::TmdbClient,
    torrentio::TorrentioClient,
};

/// Application state shared across handlers
pub struct AppState {
    pub config: Config,
    pub pool: SqlitePool,
    pub playback: PlaybackService,
    pub builder: Arc<HashIndexBuilder>,
    pub tasks: TaskManager,
    /// Server-wide defaults; `/api/resolve` may override per request
    pub preferences: ResolvePreferences,
    pub start_time: Instant,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamarr_server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // Load configuration
    let config = Config::from_env();
    config.validate()?;
    let port = config.port;

    tracing::info!("Starting StreamArr Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Data directory: {}", config.data_dir.display());

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .map_err(|e| AppError::storage(&config.data_dir, e))?;

    // Initialize SQLite connection pool
    let pool = create_pool(&config).await?;
    run_migrations(&pool).await?;

    // Provider clients
    let debrid = Arc::new(RealDebridClient::from_config(&config).map_err(AppError::from)?);
    let listing = Arc::new(TorrentioClient::from_config(&config).map_err(AppError::from)?);
    let metadata = Arc::new(TmdbClient::from_config(&config).map_err(AppError::from)?);
    let feed = Arc::new(GithubHashlistFeed::from_config(&config).map_err(AppError::from)?);
    if config.tmdb_api_key.is_empty() {
        tracing::warn!("TMDB_API_KEY is not set; TMDB-id playback will fail on cache misses");
    }

    // Stream cache + shard stores
    let cache = Arc::new(StreamCache::open(pool.clone(), &config).await?);
    tracing::info!("Stream cache initialized");

    let hashes = ShardStore::open(config.hash_shard_dir(), config.shard_cache_size).await?;
    let builder = Arc::new(
        HashIndexBuilder::new(
            feed,
            hashes,
            config.hashlist_dir(),
            BuilderPolicy::from_config(&config),
        )
        .await?,
    );
    tracing::info!("Hash index builder initialized");

    let preferences = ResolvePreferences::from_config(&config)?;
    let resolver = AvailabilityResolver::new(debrid, ResolverConfig::from_config(&config));
    let playback = PlaybackService::new(
        Arc::clone(&cache),
        listing,
        metadata,
        resolver,
        CachePolicy::from_config(&config),
    );

    let tasks = TaskManager::start();

    // Background maintenance + scheduled hash-list runs
    tokio::spawn(start_maintenance_task(
        Arc::clone(&cache),
        MaintenanceConfig::default(),
    ));
    tokio::spawn(start_hashlist_schedule(
        Arc::clone(&builder),
        tasks.clone(),
        config.hashlist_interval_secs,
    ));
    tracing::info!("Background tasks started");

    // Build application state
    let state = Arc::new(AppState {
        config,
        pool,
        playback,
        builder,
        tasks,
        preferences,
        start_time: Instant::now(),
    });

    // Build router
    let app = Router::new()
        // Health endpoints
        .route("/", get(routes::health::root))
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::health::metrics))
        .route("/ready", get(routes::health::ready))
        .route("/live", get(routes::health::live))
        // Playback
        .route("/api/resolve", get(routes::playback::resolve))
        .route(
            "/movie/:username/:password/:tmdb_id",
            get(routes::playback::play_movie),
        )
        .route(
            "/series/:username/:password/:episode_id",
            get(routes::playback::play_episode),
        )
        // Admin endpoints (protected by ADMIN_KEY)
        .route(
            "/api/admin/hashlists/run",
            post(routes::admin::run_hashlists),
        )
        .route(
            "/api/admin/series/:series_id/cache",
            post(routes::admin::cache_series),
        )
        .route(
            "/api/admin/series/:series_id/episodes",
            get(routes::admin::get_series_episodes),
        )
        .route("/api/admin/tasks", get(routes::admin::list_tasks))
        .route("/api/admin/tasks/:id", get(routes::admin::get_task))
        .route(
            "/api/admin/shards/rebuild",
            post(routes::admin::rebuild_shards),
        )
        .route("/api/admin/stats", get(routes::admin::get_stats))
        .route("/api/admin/streams", delete(routes::admin::clear_streams))
        .route(
            "/api/admin/hashes/search",
            get(routes::admin::search_hashes),
        )
        .route("/api/admin/hashes/:hash", get(routes::admin::get_hash))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
