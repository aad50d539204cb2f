//! In-process attempt store.
//!
//! Each namespace is a [`DashMap`]; an update holds the shard lock for its key
//! while the mutation runs, which gives the per-identity critical section the
//! tracker relies on. Identities in different shards never contend.
//!
//! Versions come from one store-wide counter, so a record that is removed and
//! inserted again never reuses a version an earlier writer may still hold.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};

use crate::{
    Error,
    attempt::{AttemptRecord, AttemptUpdate, Namespace, StoredAttempt},
    repositories::{AttemptMutation, AttemptRepository},
};

#[derive(Debug, Default)]
pub struct InMemoryAttemptStore {
    ip: DashMap<String, StoredAttempt>,
    username: DashMap<String, StoredAttempt>,
    last_version: AtomicU64,
}

impl InMemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self, namespace: Namespace) -> &DashMap<String, StoredAttempt> {
        match namespace {
            Namespace::Ip => &self.ip,
            Namespace::Username => &self.username,
        }
    }

    fn next_version(&self) -> u64 {
        self.last_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of records held for a namespace
    pub fn len(&self, namespace: Namespace) -> usize {
        self.records(namespace).len()
    }

    pub fn is_empty(&self) -> bool {
        self.ip.is_empty() && self.username.is_empty()
    }
}

#[async_trait]
impl AttemptRepository for InMemoryAttemptStore {
    async fn find(
        &self,
        namespace: Namespace,
        identity: &str,
    ) -> Result<Option<StoredAttempt>, Error> {
        Ok(self
            .records(namespace)
            .get(identity)
            .map(|entry| entry.value().clone()))
    }

    async fn compare_and_swap(
        &self,
        namespace: Namespace,
        identity: &str,
        expected_version: Option<u64>,
        record: &AttemptRecord,
    ) -> Result<bool, Error> {
        let swapped = match (
            self.records(namespace).entry(identity.to_string()),
            expected_version,
        ) {
            (Entry::Vacant(vacant), None) => {
                vacant.insert(StoredAttempt {
                    record: record.clone(),
                    version: self.next_version(),
                });
                true
            }
            (Entry::Occupied(mut occupied), Some(expected))
                if occupied.get().version == expected =>
            {
                occupied.insert(StoredAttempt {
                    record: record.clone(),
                    version: self.next_version(),
                });
                true
            }
            _ => false,
        };

        Ok(swapped)
    }

    async fn update(
        &self,
        namespace: Namespace,
        identity: &str,
        apply: AttemptMutation<'_>,
    ) -> Result<AttemptUpdate, Error> {
        let update = match self.records(namespace).entry(identity.to_string()) {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.get().record.clone();
                let current = apply(Some(&previous));
                occupied.insert(StoredAttempt {
                    record: current.clone(),
                    version: self.next_version(),
                });
                AttemptUpdate {
                    previous: Some(previous),
                    current,
                }
            }
            Entry::Vacant(vacant) => {
                let current = apply(None);
                vacant.insert(StoredAttempt {
                    record: current.clone(),
                    version: self.next_version(),
                });
                AttemptUpdate {
                    previous: None,
                    current,
                }
            }
        };

        Ok(update)
    }

    async fn remove(
        &self,
        namespace: Namespace,
        identity: &str,
    ) -> Result<Option<AttemptRecord>, Error> {
        Ok(self
            .records(namespace)
            .remove(identity)
            .map(|(_, stored)| stored.record))
    }

    async fn remove_stale(
        &self,
        last_failure_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, Error> {
        let mut removed = 0u64;
        for namespace in Namespace::ALL {
            self.records(namespace).retain(|_, stored| {
                let record = &stored.record;
                let stale = !record.is_locked_at(now)
                    && (record.lock_expired_at(now) || record.last_failure_at < last_failure_before);
                if stale {
                    removed += 1;
                }
                !stale
            });
        }
        Ok(removed)
    }
}
