//! Stream cache repository

use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, SqlitePool};

use crate::db::models::{CandidateRow, StreamCacheCounts, StreamEntryRow};
use crate::models::{StreamCandidate, StreamKey};

/// Get the entry header for a key
pub async fn find_entry(
    executor: impl SqliteExecutor<'_>,
    cache_key: &str,
) -> Result<Option<StreamEntryRow>, sqlx::Error> {
    sqlx::query_as::<_, StreamEntryRow>(
        r#"
        SELECT cache_key, content_id, kind, season, episode, fetched_at, unavailable, unavailable_for
        FROM stream_cache_entries
        WHERE cache_key = ?
        "#,
    )
    .bind(cache_key)
    .fetch_optional(executor)
    .await
}

/// Get candidates for a key in stored order
pub async fn find_candidates(
    executor: impl SqliteExecutor<'_>,
    cache_key: &str,
) -> Result<Vec<CandidateRow>, sqlx::Error> {
    sqlx::query_as::<_, CandidateRow>(
        r#"
        SELECT cache_key, position, quality, title, hash, file_idx, size_bytes, resolve_url
        FROM stream_candidates
        WHERE cache_key = ?
        ORDER BY position
        "#,
    )
    .bind(cache_key)
    .fetch_all(executor)
    .await
}

/// Replace the entry for a key and all its candidates in one transaction.
/// `unavailable_for` flags the entry as negative for those preferences.
pub async fn replace_entry(
    pool: &SqlitePool,
    key: &StreamKey,
    candidates: &[StreamCandidate],
    fetched_at: DateTime<Utc>,
    unavailable_for: Option<&str>,
) -> Result<(), sqlx::Error> {
    let cache_key = key.cache_key();
    let mut tx = pool.begin().await?;

    // Cascade removes the old candidate rows
    sqlx::query("DELETE FROM stream_cache_entries WHERE cache_key = ?")
        .bind(&cache_key)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO stream_cache_entries (cache_key, content_id, kind, season, episode, fetched_at, unavailable, unavailable_for)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&cache_key)
    .bind(&key.content_id)
    .bind(key.kind.as_str())
    .bind(key.season.map(i64::from))
    .bind(key.episode.map(i64::from))
    .bind(fetched_at.timestamp_millis())
    .bind(unavailable_for.is_some())
    .bind(unavailable_for)
    .execute(&mut *tx)
    .await?;

    for (position, candidate) in candidates.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO stream_candidates (cache_key, position, quality, title, hash, file_idx, size_bytes, resolve_url)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&cache_key)
        .bind(position as i64)
        .bind(candidate.quality.as_str())
        .bind(&candidate.title)
        .bind(candidate.hash.as_str())
        .bind(candidate.file_index.map(i64::from))
        .bind(candidate.size_bytes as i64)
        .bind(&candidate.resolve_url)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Flag an existing entry as unavailable under `preferences` and restart its
/// TTL clock. Returns false when there was no entry to flag.
pub async fn mark_unavailable(
    pool: &SqlitePool,
    cache_key: &str,
    preferences: &str,
    fetched_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE stream_cache_entries
        SET unavailable = 1, unavailable_for = ?, fetched_at = ?
        WHERE cache_key = ?
        "#,
    )
    .bind(preferences)
    .bind(fetched_at.timestamp_millis())
    .bind(cache_key)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Delete entries fetched before `cutoff`
pub async fn delete_older_than(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM stream_cache_entries WHERE fetched_at < ?")
        .bind(cutoff.timestamp_millis())
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Delete every entry
pub async fn delete_all(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM stream_cache_entries")
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

pub async fn counts(pool: &SqlitePool) -> Result<StreamCacheCounts, sqlx::Error> {
    sqlx::query_as::<_, StreamCacheCounts>(
        r#"
        SELECT
            (SELECT COUNT(*) FROM stream_cache_entries) AS entries,
            (SELECT COUNT(*) FROM stream_cache_entries WHERE unavailable = 1) AS unavailable,
            (SELECT COUNT(*) FROM stream_candidates) AS candidates
        "#,
    )
    .fetch_one(pool)
    .await
}
