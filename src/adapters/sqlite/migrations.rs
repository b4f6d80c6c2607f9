//! Schema versioning for the run store.
//!
//! Each schema step is a SQL file under `migrations/`, compiled into the
//! binary and applied in its own transaction. Applied versions are recorded
//! in `schema_migrations`.

use sqlx::SqlitePool;
use thiserror::Error;

/// Failure while bringing the schema up to date.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("schema step {version} ({name}) failed: {source}")]
    Step {
        version: i64,
        name: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("cannot read schema version: {0}")]
    Bookkeeping(#[source] sqlx::Error),
}

/// One schema step.
#[derive(Debug, Clone, Copy)]
pub struct SchemaStep {
    /// Position in the schema history. Applied in ascending order.
    pub version: i64,
    /// Short label for logs and errors.
    pub name: &'static str,
    /// Statements run in one transaction.
    pub sql: &'static str,
}

/// Every schema step, oldest first.
pub const SCHEMA: &[SchemaStep] = &[SchemaStep {
    version: 1,
    name: "runs and results",
    sql: include_str!("../../../migrations/001_runs_and_results.sql"),
}];

const BOOKKEEPING_DDL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    name       TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

/// Version of the newest applied step, 0 for a fresh store.
pub async fn schema_version(pool: &SqlitePool) -> Result<i64, MigrationError> {
    sqlx::query(BOOKKEEPING_DDL)
        .execute(pool)
        .await
        .map_err(MigrationError::Bookkeeping)?;
    let (version,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
        .fetch_one(pool)
        .await
        .map_err(MigrationError::Bookkeeping)?;
    Ok(version)
}

/// Bring the store up to date with `steps`. Returns the number of steps applied.
pub async fn migrate(pool: &SqlitePool, steps: &[SchemaStep]) -> Result<usize, MigrationError> {
    let current = schema_version(pool).await?;
    let mut applied = 0;
    for step in steps.iter().filter(|step| step.version > current) {
        tracing::debug!(version = step.version, name = step.name, "applying schema step");
        apply(pool, step).await?;
        applied += 1;
    }
    Ok(applied)
}

async fn apply(pool: &SqlitePool, step: &SchemaStep) -> Result<(), MigrationError> {
    let failed = |source| MigrationError::Step {
        version: step.version,
        name: step.name,
        source,
    };

    let mut tx = pool.begin().await.map_err(failed)?;
    sqlx::raw_sql(step.sql).execute(&mut *tx).await.map_err(failed)?;
    sqlx::query("INSERT INTO schema_migrations (version, name) VALUES (?, ?)")
        .bind(step.version)
        .bind(step.name)
        .execute(&mut *tx)
        .await
        .map_err(failed)?;
    tx.commit().await.map_err(failed)
}
