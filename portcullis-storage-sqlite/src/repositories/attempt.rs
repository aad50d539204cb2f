//! SQLite implementation of the attempt repository.
//!
//! Every write runs in a `BEGIN IMMEDIATE` transaction, which takes the
//! database write lock up front. [`AttemptRepository::update`] reads, applies
//! and writes under that lock, so concurrent failures never need a retry.
//! Versions are minted from the `attempt_version_seq` row and never repeat,
//! even after a record is deleted and created again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use portcullis_core::{
    Error,
    attempt::{AttemptRecord, AttemptUpdate, Namespace, StoredAttempt},
    error::{StorageError, utilities::DatabaseResultExt},
    repositories::{AttemptMutation, AttemptRepository},
};
use portcullis_migration::MigrationManager;
use sqlx::{SqliteConnection, SqlitePool, Transaction, sqlite::Sqlite};

use crate::migrations::{SqliteMigrationManager, migrations};

const SELECT_RECORD: &str = r#"
    SELECT identity, failure_count, first_failure_at, last_failure_at, locked_until, version
    FROM attempt_records
    WHERE namespace = ? AND identity = ?
"#;

/// SQLite repository for attempt records.
#[derive(Clone, Debug)]
pub struct SqliteAttemptRepository {
    pool: SqlitePool,
}

impl SqliteAttemptRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>, Error> {
        self.pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_db_err_with_context("Failed to start attempt transaction")
    }
}

/// Internal struct for query results
#[derive(Debug, sqlx::FromRow)]
struct SqliteAttemptRecord {
    identity: String,
    failure_count: i64,
    first_failure_at: i64,
    last_failure_at: i64,
    locked_until: Option<i64>,
    version: i64,
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>, Error> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        tracing::error!(millis, "Attempt record holds an out of range timestamp");
        Error::Storage(StorageError::Database(
            "Invalid timestamp in attempt record".to_string(),
        ))
    })
}

impl TryFrom<SqliteAttemptRecord> for StoredAttempt {
    type Error = Error;

    fn try_from(row: SqliteAttemptRecord) -> Result<Self, Self::Error> {
        Ok(StoredAttempt {
            record: AttemptRecord {
                identity: row.identity,
                failure_count: u32::try_from(row.failure_count).unwrap_or(u32::MAX),
                first_failure_at: timestamp(row.first_failure_at)?,
                last_failure_at: timestamp(row.last_failure_at)?,
                locked_until: row.locked_until.map(timestamp).transpose()?,
            },
            version: row.version as u64,
        })
    }
}

/// Take the next version from the sequence. Must run inside a write transaction.
async fn next_version(conn: &mut SqliteConnection) -> Result<i64, Error> {
    sqlx::query_scalar::<_, i64>(
        "UPDATE attempt_version_seq SET value = value + 1 WHERE id = 1 RETURNING value",
    )
    .fetch_optional(&mut *conn)
    .await
    .map_db_err_with_context("Failed to allocate attempt record version")?
    .ok_or_else(|| {
        Error::Storage(StorageError::Database(
            "Attempt version sequence is missing, run migrations".to_string(),
        ))
    })
}

/// Insert unless a record already exists. Returns whether a row was written.
async fn insert_record(
    conn: &mut SqliteConnection,
    namespace: Namespace,
    identity: &str,
    record: &AttemptRecord,
    version: i64,
) -> Result<bool, Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO attempt_records
            (namespace, identity, failure_count, first_failure_at, last_failure_at, locked_until, version)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (namespace, identity) DO NOTHING
        "#,
    )
    .bind(namespace.as_str())
    .bind(identity)
    .bind(i64::from(record.failure_count))
    .bind(record.first_failure_at.timestamp_millis())
    .bind(record.last_failure_at.timestamp_millis())
    .bind(record.locked_until.map(|until| until.timestamp_millis()))
    .bind(version)
    .execute(&mut *conn)
    .await
    .map_db_err_with_context("Failed to insert attempt record")?;

    Ok(result.rows_affected() == 1)
}

/// Overwrite the record if it is still at `expected_version`.
async fn replace_record(
    conn: &mut SqliteConnection,
    namespace: Namespace,
    identity: &str,
    record: &AttemptRecord,
    expected_version: i64,
    version: i64,
) -> Result<bool, Error> {
    let result = sqlx::query(
        r#"
        UPDATE attempt_records
        SET failure_count = ?, first_failure_at = ?, last_failure_at = ?,
            locked_until = ?, version = ?
        WHERE namespace = ? AND identity = ? AND version = ?
        "#,
    )
    .bind(i64::from(record.failure_count))
    .bind(record.first_failure_at.timestamp_millis())
    .bind(record.last_failure_at.timestamp_millis())
    .bind(record.locked_until.map(|until| until.timestamp_millis()))
    .bind(version)
    .bind(namespace.as_str())
    .bind(identity)
    .bind(expected_version)
    .execute(&mut *conn)
    .await
    .map_db_err_with_context("Failed to update attempt record")?;

    Ok(result.rows_affected() == 1)
}

#[async_trait]
impl AttemptRepository for SqliteAttemptRepository {
    async fn find(
        &self,
        namespace: Namespace,
        identity: &str,
    ) -> Result<Option<StoredAttempt>, Error> {
        let row = sqlx::query_as::<_, SqliteAttemptRecord>(SELECT_RECORD)
            .bind(namespace.as_str())
            .bind(identity)
            .fetch_optional(&self.pool)
            .await
            .map_db_err_with_context("Failed to load attempt record")?;

        row.map(StoredAttempt::try_from).transpose()
    }

    async fn compare_and_swap(
        &self,
        namespace: Namespace,
        identity: &str,
        expected_version: Option<u64>,
        record: &AttemptRecord,
    ) -> Result<bool, Error> {
        let mut tx = self.begin_write().await?;
        let version = next_version(&mut tx).await?;

        let written = match expected_version {
            None => insert_record(&mut tx, namespace, identity, record, version).await?,
            Some(expected) => {
                let Ok(expected) = i64::try_from(expected) else {
                    return Ok(false);
                };
                replace_record(&mut tx, namespace, identity, record, expected, version).await?
            }
        };

        if written {
            tx.commit()
                .await
                .map_db_err_with_context("Failed to commit attempt record")?;
        } else {
            // Leave the sequence untouched when nothing was written
            tx.rollback()
                .await
                .map_db_err_with_context("Failed to roll back attempt transaction")?;
        }

        Ok(written)
    }

    async fn update(
        &self,
        namespace: Namespace,
        identity: &str,
        apply: AttemptMutation<'_>,
    ) -> Result<AttemptUpdate, Error> {
        let mut tx = self.begin_write().await?;

        let stored = sqlx::query_as::<_, SqliteAttemptRecord>(SELECT_RECORD)
            .bind(namespace.as_str())
            .bind(identity)
            .fetch_optional(&mut *tx)
            .await
            .map_db_err_with_context("Failed to load attempt record")?
            .map(StoredAttempt::try_from)
            .transpose()?;

        let expected_version = stored.as_ref().map(|stored| stored.version as i64);
        let previous = stored.map(|stored| stored.record);
        let current = apply(previous.as_ref());
        let version = next_version(&mut tx).await?;

        let written = match expected_version {
            None => insert_record(&mut tx, namespace, identity, &current, version).await?,
            Some(expected) => {
                replace_record(&mut tx, namespace, identity, &current, expected, version).await?
            }
        };
        if !written {
            // Unreachable while the write lock is held
            return Err(Error::Storage(StorageError::Conflict(format!(
                "attempt record {namespace}/{identity} changed under a write lock"
            ))));
        }

        tx.commit()
            .await
            .map_db_err_with_context("Failed to commit attempt record")?;

        Ok(AttemptUpdate { previous, current })
    }

    async fn remove(
        &self,
        namespace: Namespace,
        identity: &str,
    ) -> Result<Option<AttemptRecord>, Error> {
        let row = sqlx::query_as::<_, SqliteAttemptRecord>(
            r#"
            DELETE FROM attempt_records
            WHERE namespace = ? AND identity = ?
            RETURNING identity, failure_count, first_failure_at, last_failure_at, locked_until, version
            "#,
        )
        .bind(namespace.as_str())
        .bind(identity)
        .fetch_optional(&self.pool)
        .await
        .map_db_err_with_context("Failed to remove attempt record")?;

        Ok(row
            .map(StoredAttempt::try_from)
            .transpose()?
            .map(|stored| stored.record))
    }

    async fn remove_stale(
        &self,
        last_failure_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM attempt_records
            WHERE (locked_until IS NOT NULL AND locked_until <= ?)
               OR (locked_until IS NULL AND last_failure_at < ?)
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(last_failure_before.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_db_err_with_context("Failed to remove stale attempt records")?;

        Ok(result.rows_affected())
    }

    async fn migrate(&self) -> Result<(), Error> {
        let manager = SqliteMigrationManager::new(self.pool.clone());
        manager.initialize().await?;
        manager.up(&migrations()).await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), Error> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(StorageError::Connection(e.to_string())))?;
        Ok(())
    }
}
