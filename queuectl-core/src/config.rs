use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

/// Name of the store file, created in the working directory by default.
pub const STORE_FILE: &str = "queue.db";

/// Recognized config table keys, with their defaults.
pub const CONFIG_MAX_RETRIES: &str = "max_retries";
pub const CONFIG_BACKOFF_BASE: &str = "backoff_base";
pub const DEFAULT_MAX_RETRIES: i64 = 3;
pub const DEFAULT_BACKOFF_BASE: i64 = 2;

const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 10;

/// A store config object, designed to be passable across process boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// How long a connection waits on the write lock before reporting busy.
    pub busy_timeout_seconds: Option<u64>, // Default to 10
    pub max_connections: Option<u32>,      // Default to 5
}

impl StoreConfig {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_owned(),
            busy_timeout_seconds: None,
            max_connections: None,
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_seconds.unwrap_or(DEFAULT_BUSY_TIMEOUT_SECS))
    }

    /// Open the store file, creating it if absent. The write-ahead journal is
    /// what lets the supervisor, workers and admin commands share one file.
    pub async fn connect(&self) -> Result<SqlitePool, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(self.busy_timeout())
            .foreign_keys(true);

        SqlitePoolOptions::new()
            .max_connections(self.max_connections.unwrap_or(5))
            .connect_with(options)
            .await
    }
}
