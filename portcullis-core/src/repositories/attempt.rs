//! Repository trait for attempt tracking.
//!
//! The store holds one [`AttemptRecord`] per identity and namespace. It carries
//! no policy: staleness, delays and lock transitions are decided by the caller
//! and written back through an atomic read-modify-write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    Error,
    attempt::{AttemptRecord, AttemptUpdate, Namespace, StoredAttempt},
    error::StorageError,
};

/// Upper bound on compare-and-swap retries in the default [`AttemptRepository::update`].
pub const MAX_CAS_RETRIES: usize = 32;

/// Pure function from the current record (if any) to the record to write.
///
/// It may be called more than once per update when a compare-and-swap loses a race,
/// so it must not have side effects.
pub type AttemptMutation<'a> = &'a (dyn Fn(Option<&AttemptRecord>) -> AttemptRecord + Send + Sync);

/// Storage for attempt records.
///
/// # Concurrency
///
/// Mutations of a single identity must be linearizable: two concurrent updates
/// must never both observe the same previous record and both succeed. Backends
/// either serialize access per key (and override [`update`](Self::update)) or
/// implement a versioned [`compare_and_swap`](Self::compare_and_swap) and rely on
/// the default retry loop. Operations on different identities must not need any
/// coordination beyond what the backend imposes internally.
///
/// Reads may run concurrently with [`remove_stale`](Self::remove_stale); a sweep
/// that removes a record under an in-flight update only causes that update to
/// retry against the absent record.
#[async_trait]
pub trait AttemptRepository: Send + Sync + 'static {
    /// Load the record for an identity together with its version.
    async fn find(
        &self,
        namespace: Namespace,
        identity: &str,
    ) -> Result<Option<StoredAttempt>, Error>;

    /// Write `record` only if the stored version still matches.
    ///
    /// `expected_version == None` means "insert only if absent". Returns `false`
    /// when another writer got there first. A backend must never hand out a
    /// version twice for one identity, including across a remove and re-insert.
    async fn compare_and_swap(
        &self,
        namespace: Namespace,
        identity: &str,
        expected_version: Option<u64>,
        record: &AttemptRecord,
    ) -> Result<bool, Error>;

    /// Atomically replace the record with `apply(previous)`.
    async fn update(
        &self,
        namespace: Namespace,
        identity: &str,
        apply: AttemptMutation<'_>,
    ) -> Result<AttemptUpdate, Error> {
        for retry in 0..MAX_CAS_RETRIES {
            let stored = self.find(namespace, identity).await?;
            let expected_version = stored.as_ref().map(|stored| stored.version);
            let previous = stored.map(|stored| stored.record);
            let current = apply(previous.as_ref());

            if self
                .compare_and_swap(namespace, identity, expected_version, &current)
                .await?
            {
                return Ok(AttemptUpdate { previous, current });
            }

            tracing::debug!(
                namespace = %namespace,
                identity,
                retry,
                "Attempt record changed concurrently, retrying"
            );
        }

        Err(Error::Storage(StorageError::Conflict(format!(
            "gave up updating {namespace}/{identity} after {MAX_CAS_RETRIES} attempts"
        ))))
    }

    /// Delete the record for an identity, returning what was removed.
    async fn remove(
        &self,
        namespace: Namespace,
        identity: &str,
    ) -> Result<Option<AttemptRecord>, Error>;

    /// Delete records that are no longer meaningful.
    ///
    /// A record is removed when it is not locked at `now` and either its lock has
    /// expired or its last failure is older than `last_failure_before`. Records
    /// locked at `now` are always kept.
    async fn remove_stale(
        &self,
        last_failure_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, Error>;

    /// Prepare the backing schema, if any
    async fn migrate(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Verify the backend is reachable
    async fn health_check(&self) -> Result<(), Error> {
        Ok(())
    }
}
