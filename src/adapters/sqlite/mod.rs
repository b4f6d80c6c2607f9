//! SQLite-backed run store.

pub mod connection;
pub mod migrations;
pub mod run_repository;

pub use connection::{open_memory_pool, open_pool, ConnectionError, StoreLocation};
pub use migrations::{migrate, schema_version, MigrationError, SchemaStep, SCHEMA};
pub use run_repository::SqliteRunRepository;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::DatabaseConfig;

/// Failure to open or migrate the run store.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

/// Open the configured store and bring its schema up to date.
pub async fn initialize_database(config: &DatabaseConfig) -> Result<SqlitePool, DatabaseError> {
    let pool = open_pool(config).await?;
    let applied = migrate(&pool, SCHEMA).await?;
    if applied > 0 {
        tracing::info!(applied, path = %config.path, "run store schema updated");
    }
    Ok(pool)
}

/// Fresh in-memory store with the full schema.
pub async fn create_migrated_test_pool() -> Result<SqlitePool, DatabaseError> {
    let pool = open_memory_pool().await?;
    migrate(&pool, SCHEMA).await?;
    Ok(pool)
}

fn corrupt(column: &str, err: impl std::fmt::Display) -> DomainError {
    DomainError::SerializationError(format!("column {column}: {err}"))
}

pub(crate) fn parse_uuid(column: &str, raw: &str) -> DomainResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| corrupt(column, e))
}

/// Timestamps are stored as RFC 3339 text.
pub(crate) fn parse_datetime(column: &str, raw: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| corrupt(column, e))
}

pub(crate) fn parse_optional_datetime(column: &str, raw: Option<String>) -> DomainResult<Option<DateTime<Utc>>> {
    raw.map(|raw| parse_datetime(column, &raw)).transpose()
}

/// JSON columns may be NULL or empty; both read back as the default value.
pub(crate) fn parse_json_or_default<T: DeserializeOwned + Default>(column: &str, raw: Option<String>) -> DomainResult<T> {
    match raw.as_deref() {
        None | Some("") => Ok(T::default()),
        Some(json) => serde_json::from_str(json).map_err(|e| corrupt(column, e)),
    }
}
