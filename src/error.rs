//! Error taxonomy
//!
//! `AppError` is what orchestrating operations return. Provider clients speak
//! `ProviderError`, which folds into `AppError::Transport` or `AppError::Decode`.
//! "No cached stream" is not an error: see `models::Resolution::Unavailable`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Network/timeout talking to an external provider
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed document or payload
    #[error("decode error: {0}")]
    Decode(String),

    /// Shard file unreadable/unwritable
    #[error("storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Missing credentials or invalid settings (startup only)
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("not found: {0}")]
    NotFound(String),

    /// Caller-supplied parameter rejected (bad quality name, bad regex)
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl AppError {
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AppError::Storage {
            path: path.into(),
            source,
        }
    }

    /// Transport-level outages are the only failures a playback caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Transport(_))
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Errors raised by the HTTP provider clients (debrid, listing, metadata, feed)
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("HTTP error: {0}")]
    Http(u16),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty response")]
    EmptyResponse,
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if let Some(status) = err.status() {
            ProviderError::Http(status.as_u16())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

const BODY_PREVIEW_CHARS: usize = 500;

/// Leading part of a provider response body for logging, cut on a char boundary
pub fn body_preview(text: &str) -> &str {
    match text.char_indices().nth(BODY_PREVIEW_CHARS) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Parse(msg) => AppError::Decode(msg),
            other => AppError::Transport(other.to_string()),
        }
    }
}
