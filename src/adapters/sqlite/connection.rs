//! Pool construction for the run store.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::domain::models::DatabaseConfig;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure to open the run store.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("cannot open run store at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("cannot create directory {}: {source}", .dir.display())]
    CreateDir {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where the run store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    Memory,
}

impl StoreLocation {
    /// Accepts a bare path, a `sqlite:` URL or `:memory:`.
    pub fn parse(raw: &str) -> Self {
        let path = raw
            .strip_prefix("sqlite://")
            .or_else(|| raw.strip_prefix("sqlite:"))
            .unwrap_or(raw);
        if path.is_empty() || path == ":memory:" {
            Self::Memory
        } else {
            Self::File(PathBuf::from(path))
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Memory => ":memory:".to_string(),
        }
    }
}

/// Open a pool for the configured store, creating the file and its parent
/// directory when missing.
pub async fn open_pool(config: &DatabaseConfig) -> Result<SqlitePool, ConnectionError> {
    let location = StoreLocation::parse(&config.path);
    let options = match &location {
        StoreLocation::Memory => return open_memory_pool().await,
        StoreLocation::File(path) => {
            create_parent_dir(path)?;
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .foreign_keys(true)
                .busy_timeout(BUSY_TIMEOUT)
        }
    };

    SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(options)
        .await
        .map_err(|source| ConnectionError::Open {
            path: location.describe(),
            source,
        })
}

/// In-memory store. Every connection to `:memory:` is its own database, so
/// the pool is pinned to one connection.
pub async fn open_memory_pool() -> Result<SqlitePool, ConnectionError> {
    let options = SqliteConnectOptions::new().in_memory(true).foreign_keys(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(|source| ConnectionError::Open {
            path: StoreLocation::Memory.describe(),
            source,
        })
}

fn create_parent_dir(path: &Path) -> Result<(), ConnectionError> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() && !dir.exists() => {
            std::fs::create_dir_all(dir).map_err(|source| ConnectionError::CreateDir {
                dir: dir.to_path_buf(),
                source,
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_location_parse() {
        assert_eq!(
            StoreLocation::parse(".rehearse/rehearse.db"),
            StoreLocation::File(PathBuf::from(".rehearse/rehearse.db"))
        );
        assert_eq!(
            StoreLocation::parse("sqlite://runs.db"),
            StoreLocation::File(PathBuf::from("runs.db"))
        );
        assert_eq!(StoreLocation::parse("sqlite::memory:"), StoreLocation::Memory);
        assert_eq!(StoreLocation::parse(":memory:"), StoreLocation::Memory);
    }

    #[tokio::test]
    async fn test_open_pool_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("runs.db");
        let config = DatabaseConfig {
            path: path.to_string_lossy().into_owned(),
            max_connections: 2,
        };

        let pool = open_pool(&config).await.unwrap();
        sqlx::query("SELECT 1").execute(&pool).await.unwrap();
        assert!(path.exists());
    }
}
