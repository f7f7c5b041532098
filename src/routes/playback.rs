//! Playback routes
//!
//! JSON resolution for API callers, plus Xtream-style movie/series URLs that
//! redirect players straight to the resolved stream.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::config::Config;
use crate::models::{ContentKind, Resolution, StreamKey};
use crate::routes::{app_error, error_response, ApiError};
use crate::services::resolver::ResolvePreferences;
use crate::AppState;

// ============================================================================
// Query Parameters
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    pub imdb: String,
    pub kind: Option<String>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub max_resolution: Option<String>,
    pub exclude: Option<String>,
}

fn stream_key(query: &ResolveQuery) -> Result<StreamKey, ApiError> {
    let imdb = query.imdb.trim();
    if !imdb.starts_with("tt") {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "imdb must be an IMDB id (tt...)",
        ));
    }

    let kind = match query.kind.as_deref() {
        Some(raw) => raw
            .parse::<ContentKind>()
            .map_err(|e| error_response(StatusCode::BAD_REQUEST, &e))?,
        None => ContentKind::Movie,
    };

    match (kind, query.season, query.episode) {
        (ContentKind::Movie, _, _) => Ok(StreamKey::movie(imdb)),
        (ContentKind::Series, Some(season), Some(episode)) => {
            Ok(StreamKey::episode(imdb, season, episode))
        }
        (ContentKind::Series, _, _) => Err(error_response(
            StatusCode::BAD_REQUEST,
            "series requests need season and episode",
        )),
    }
}

/// "550.mkv" → 550
fn parse_media_id(raw: &str) -> Result<u64, ApiError> {
    let stem = raw.split_once('.').map(|(stem, _)| stem).unwrap_or(raw);
    stem.parse()
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid id"))
}

/// Player credentials are only enforced when both are configured
fn credentials_match(config: &Config, username: &str, password: &str) -> bool {
    match (&config.xtream_username, &config.xtream_password) {
        (Some(expected_user), Some(expected_pass)) => {
            expected_user == username && expected_pass == password
        }
        _ => true,
    }
}

fn unavailable() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "status": "unavailable" })),
    )
        .into_response()
}

fn redirect(resolution: Resolution) -> Response {
    match resolution.url() {
        Some(url) => (StatusCode::FOUND, [(header::LOCATION, url.to_string())]).into_response(),
        None => unavailable(),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/resolve - Resolve one movie or episode to a playable URL
pub async fn resolve(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ResolveQuery>,
) -> Result<Response, ApiError> {
    let key = stream_key(&query)?;
    let prefs: ResolvePreferences = state
        .preferences
        .with_overrides(query.max_resolution.as_deref(), query.exclude.as_deref())
        .map_err(app_error)?;

    let resolution = state
        .playback
        .resolve_stream(&key, &prefs)
        .await
        .map_err(app_error)?;

    Ok(match resolution {
        Resolution::Unavailable => unavailable(),
        playable => Json(playable).into_response(),
    })
}

/// GET /movie/:username/:password/:tmdb_id - Redirect to the movie stream
pub async fn play_movie(
    State(state): State<Arc<AppState>>,
    Path((username, password, raw_id)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    if !credentials_match(&state.config, &username, &password) {
        return Err(error_response(StatusCode::UNAUTHORIZED, "Invalid credentials"));
    }
    let tmdb_id = parse_media_id(&raw_id)?;

    let resolution = state
        .playback
        .resolve_movie(tmdb_id, &state.preferences)
        .await
        .map_err(app_error)?;

    Ok(redirect(resolution))
}

/// GET /series/:username/:password/:episode_id - Redirect to the episode stream
pub async fn play_episode(
    State(state): State<Arc<AppState>>,
    Path((username, password, raw_id)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    if !credentials_match(&state.config, &username, &password) {
        return Err(error_response(StatusCode::UNAUTHORIZED, "Invalid credentials"));
    }
    let episode_id = parse_media_id(&raw_id)?;

    let resolution = state
        .playback
        .resolve_episode(episode_id, &state.preferences)
        .await
        .map_err(app_error)?;

    Ok(redirect(resolution))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(kind: Option<&str>, season: Option<u32>, episode: Option<u32>) -> ResolveQuery {
        ResolveQuery {
            imdb: "tt0903747".to_string(),
            kind: kind.map(str::to_string),
            season,
            episode,
            max_resolution: None,
            exclude: None,
        }
    }

    #[test]
    fn test_stream_key_from_query() {
        assert_eq!(
            stream_key(&query(None, None, None)).unwrap(),
            StreamKey::movie("tt0903747")
        );
        assert_eq!(
            stream_key(&query(Some("series"), Some(1), Some(2))).unwrap(),
            StreamKey::episode("tt0903747", 1, 2)
        );

        let (status, _) = stream_key(&query(Some("series"), Some(1), None)).unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = stream_key(&query(Some("music"), None, None)).unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_parse_media_id_strips_extension() {
        assert_eq!(parse_media_id("550.mkv").unwrap(), 550);
        assert_eq!(parse_media_id("62228").unwrap(), 62228);
        assert!(parse_media_id("abc.mp4").is_err());
    }

    #[test]
    fn test_redirect_uses_found() {
        let response = redirect(Resolution::Playable {
            url: "https://download.example/movie.mkv".to_string(),
            hash: crate::models::InfoHash::parse(&"ab".repeat(20)).unwrap(),
            quality: crate::models::Quality::P1080,
        });
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://download.example/movie.mkv"
        );
        assert_eq!(redirect(Resolution::Unavailable).status(), StatusCode::NOT_FOUND);
    }
}
