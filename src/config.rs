use regex::Regex;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::error::AppError;

pub const DEFAULT_EXCLUDE_PATTERN: &str =
    r"(?i)\b(DTS|REMUX|HDR|HDR10|DV|DOVI|3D|CAM|TS|TELESYNC|TELECINE|SCR|SCREENER)\b";

const DEFAULT_TORRENTIO_PROVIDERS: &str =
    "yts,eztv,rarbg,1337x,thepiratebay,kickasstorrents,torrentgalaxy,magnetdl";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub port: u16,
    pub admin_key: Option<String>,
    pub xtream_username: Option<String>,
    pub xtream_password: Option<String>,

    // Storage
    pub database_url: String,
    pub data_dir: PathBuf,
    pub shard_cache_size: usize,

    // Providers
    pub rd_api_token: String,
    pub rd_base_url: String,
    pub torrentio_base_url: String,
    pub torrentio_providers: String,
    pub tmdb_api_key: String,
    pub tmdb_base_url: String,

    // Stream cache
    pub stream_cache_ttl_hours: i64,
    pub negative_cache_ttl_hours: i64,

    // Resolution
    pub fallback_attempts: usize,
    pub max_resolution: String,
    pub exclude_pattern: String,

    // Hash lists
    pub hashlist_list_url: String,
    pub hashlist_raw_url: String,
    pub hashlist_max_documents: usize,
    pub hashlist_page_size: usize,
    pub hashlist_interval_secs: u64,

    // Timeouts (seconds)
    pub batch_timeout_secs: u64,
    pub add_timeout_secs: u64,
    pub info_timeout_secs: u64,
    pub listing_timeout_secs: u64,
    pub cleanup_timeout_secs: u64,

    // Misc
    pub user_agent: String,
}

fn var_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn string_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            // Server
            port: var_or("PORT", 8080),
            admin_key: non_empty("ADMIN_KEY"),
            xtream_username: non_empty("XTREAM_USERNAME"),
            xtream_password: non_empty("XTREAM_PASSWORD"),

            // Storage
            database_url: string_or("DATABASE_URL", "sqlite://data/streamarr.db"),
            data_dir: PathBuf::from(string_or("DATA_DIR", "data")),
            shard_cache_size: var_or("SHARD_CACHE_SIZE", 5),

            // Providers
            rd_api_token: string_or("RD_API_TOKEN", ""),
            rd_base_url: string_or("RD_BASE_URL", "https://api.real-debrid.com/rest/1.0"),
            torrentio_base_url: string_or("TORRENTIO_BASE_URL", "https://torrentio.strem.fun"),
            torrentio_providers: string_or("TORRENTIO_PROVIDERS", DEFAULT_TORRENTIO_PROVIDERS),
            tmdb_api_key: string_or("TMDB_API_KEY", ""),
            tmdb_base_url: string_or("TMDB_BASE_URL", "https://api.themoviedb.org/3"),

            // Stream cache
            stream_cache_ttl_hours: var_or("STREAM_CACHE_TTL_HOURS", 24),
            negative_cache_ttl_hours: var_or("NEGATIVE_CACHE_TTL_HOURS", 1),

            // Resolution
            fallback_attempts: var_or("FALLBACK_ATTEMPTS", 3),
            max_resolution: string_or("MAX_RESOLUTION", "2160p"),
            exclude_pattern: string_or("EXCLUDE_PATTERN", DEFAULT_EXCLUDE_PATTERN),

            // Hash lists
            hashlist_list_url: string_or(
                "HASHLIST_LIST_URL",
                "https://api.github.com/repos/debridmediamanager/hashlists/contents",
            ),
            hashlist_raw_url: string_or(
                "HASHLIST_RAW_URL",
                "https://raw.githubusercontent.com/debridmediamanager/hashlists/main",
            ),
            hashlist_max_documents: var_or("HASHLIST_MAX_DOCUMENTS", 10),
            hashlist_page_size: var_or("HASHLIST_PAGE_SIZE", 100),
            hashlist_interval_secs: var_or("HASHLIST_INTERVAL_SECS", 21_600), // 6 hours

            // Timeouts
            batch_timeout_secs: var_or("RD_BATCH_TIMEOUT_SECS", 30),
            add_timeout_secs: var_or("RD_ADD_TIMEOUT_SECS", 20),
            info_timeout_secs: var_or("RD_INFO_TIMEOUT_SECS", 10),
            listing_timeout_secs: var_or("LISTING_TIMEOUT_SECS", 20),
            cleanup_timeout_secs: var_or("CLEANUP_TIMEOUT_SECS", 5),

            // Misc
            user_agent: env::var("USER_AGENT")
                .unwrap_or_else(|_| format!("streamarr/{}", env!("CARGO_PKG_VERSION"))),
        }
    }

    /// Fails fast on settings the service cannot run without.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.rd_api_token.trim().is_empty() {
            return Err(AppError::Configuration(
                "RD_API_TOKEN is required".to_string(),
            ));
        }
        for (name, value) in [
            ("RD_BASE_URL", &self.rd_base_url),
            ("TORRENTIO_BASE_URL", &self.torrentio_base_url),
            ("TMDB_BASE_URL", &self.tmdb_base_url),
            ("HASHLIST_LIST_URL", &self.hashlist_list_url),
            ("HASHLIST_RAW_URL", &self.hashlist_raw_url),
        ] {
            if let Err(e) = Url::parse(value) {
                return Err(AppError::Configuration(format!(
                    "{} '{}' is not a valid URL: {}",
                    name, value, e
                )));
            }
        }
        if let Err(e) = Regex::new(&self.exclude_pattern) {
            return Err(AppError::Configuration(format!(
                "EXCLUDE_PATTERN does not compile: {}",
                e
            )));
        }
        if self.max_resolution.parse::<crate::models::Quality>().is_err() {
            return Err(AppError::Configuration(format!(
                "MAX_RESOLUTION '{}' is not a known quality",
                self.max_resolution
            )));
        }
        Ok(())
    }

    pub fn stream_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.stream_cache_ttl_hours)
    }

    pub fn negative_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.negative_cache_ttl_hours)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }

    pub fn episode_shard_dir(&self) -> PathBuf {
        self.data_dir.join("episode_shards")
    }

    pub fn movie_shard_dir(&self) -> PathBuf {
        self.data_dir.join("movie_shards")
    }

    pub fn series_shard_dir(&self) -> PathBuf {
        self.data_dir.join("series_shards")
    }

    pub fn hash_shard_dir(&self) -> PathBuf {
        self.data_dir.join("hash_shards")
    }

    pub fn hashlist_dir(&self) -> PathBuf {
        self.data_dir.join("hashlists")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
