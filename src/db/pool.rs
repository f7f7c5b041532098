//! Database connection pool management

use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqliteConnection;
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, info};

use crate::config::Config;

const MAX_CONNECTIONS: u32 = 5;

fn base_options(options: SqliteConnectOptions) -> SqliteConnectOptions {
    options
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(1500))
}

async fn apply_pragmas(
    conn: &mut SqliteConnection,
    _meta: PoolConnectionMetadata,
) -> Result<(), sqlx::Error> {
    sqlx::query("PRAGMA temp_store = MEMORY; PRAGMA cache_size = -8192;")
        .execute(conn)
        .await?;
    Ok(())
}

/// Create the SQLite connection pool backing the stream cache
pub async fn create_pool(config: &Config) -> Result<SqlitePool, sqlx::Error> {
    info!("Connecting to SQLite at {}...", config.database_url);

    let options = base_options(SqliteConnectOptions::from_str(&config.database_url)?)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .after_connect(|conn, meta| Box::pin(async move { apply_pragmas(conn, meta).await }))
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await?;

    info!("SQLite connection pool created with max {} connections", MAX_CONNECTIONS);

    Ok(pool)
}

/// In-memory pool; one connection so every query sees the same database.
pub async fn create_memory_pool() -> Result<SqlitePool, sqlx::Error> {
    let options = base_options(SqliteConnectOptions::from_str("sqlite::memory:")?);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    info!("Running database migrations...");

    sqlx::migrate!("./migrations").run(pool).await?;

    info!("Database migrations completed");

    Ok(())
}

/// Health check for the database
pub async fn health_check(pool: &SqlitePool) -> bool {
    match sqlx::query("SELECT 1").fetch_one(pool).await {
        Ok(_) => true,
        Err(e) => {
            error!("Database health check failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pool_migrates_and_enforces_foreign_keys() {
        let pool = create_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        // Second run is a no-op
        run_migrations(&pool).await.unwrap();

        let row: (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, 1);
        assert!(health_check(&pool).await);
    }
}
