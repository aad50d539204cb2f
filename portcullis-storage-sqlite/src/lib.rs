//! SQLite storage backend for portcullis
//!
//! Attempt records live in a single `attempt_records` table keyed by
//! `(namespace, identity)`. Open a store with [`SqliteAttemptRepository::connect`]
//! and call `migrate()` once before use.

pub mod migrations;
pub mod repositories;

pub use repositories::SqliteAttemptRepository;
pub use sqlx::SqlitePool;

use std::str::FromStr;

use portcullis_core::{Error, error::StorageError};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

impl SqliteAttemptRepository {
    /// Open a pool for `database_url`, creating the database file if needed.
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| {
                tracing::error!(error = %e, "Invalid SQLite connection string");
                Error::Storage(StorageError::Connection(
                    "Invalid SQLite connection string".to_string(),
                ))
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to SQLite");
                Error::Storage(StorageError::Connection(
                    "Failed to connect to database".to_string(),
                ))
            })?;

        tracing::debug!("Connected to SQLite attempt store");
        Ok(Self::new(pool))
    }
}
