use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// What a migration pass did to the schema.
#[derive(Debug)]
pub struct MigrationReport {
    pub newly_applied: usize,
    pub schema_version: Option<i64>,
}

pub async fn run_pending(pool: &DbPool) -> Result<MigrationReport, MigrateError> {
    let before = applied_versions(pool).await;
    MIGRATOR.run(pool).await?;
    let after = applied_versions(pool).await;

    Ok(MigrationReport {
        newly_applied: after.len().saturating_sub(before.len()),
        schema_version: after.last().copied(),
    })
}

/// Versions already recorded in sqlx's bookkeeping table. An empty list
/// covers both a fresh database and one the migrator has never touched.
async fn applied_versions(pool: &DbPool) -> Vec<i64> {
    sqlx::query_scalar::<_, i64>("SELECT version FROM _sqlx_migrations ORDER BY version")
        .fetch_all(pool)
        .await
        .unwrap_or_default()
}
