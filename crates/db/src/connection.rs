use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;

use poltergeist_core::config::DatabaseConfig;

pub type DbPool = sqlx::SqlitePool;

/// Busy handler for pools opened without a full [`DatabaseConfig`],
/// matching its default.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Open a pool with the operator-facing settings from `poltergeist.toml`.
pub async fn connect(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    build_pool(&config.url, config.max_connections, config.timeout_secs, config.busy_timeout_ms)
        .await
}

pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    build_pool(database_url, max_connections, timeout_secs, DEFAULT_BUSY_TIMEOUT_MS).await
}

async fn build_pool(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
    busy_timeout_ms: u64,
) -> Result<DbPool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                // WAL keeps the reservation sweep reading while a checkout
                // writes; the busy handler bounds how long contending
                // checkout writers wait on each other.
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                sqlx::query(&format!("PRAGMA busy_timeout = {busy_timeout_ms}"))
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await
}
