//! Attempt records and tracking namespaces
//!
//! Failed authentication attempts are tracked per identity. An identity is either
//! a client IP address or a username, and each kind lives in its own [`Namespace`]
//! so that a lockout can be enforced by source address (distributed username
//! guessing) or by account (credential stuffing from many addresses).
//!
//! | Field              | Type               | Description                                          |
//! | ------------------ | ------------------ | ---------------------------------------------------- |
//! | `identity`         | `String`           | The tracking key (IP address or username).           |
//! | `failure_count`    | `u32`              | Failures since the last reset.                       |
//! | `first_failure_at` | `DateTime`         | When the current run of failures started.            |
//! | `last_failure_at`  | `DateTime`         | When the most recent failure was recorded.           |
//! | `locked_until`     | `Option<DateTime>` | Present while the identity is (or was last) locked.  |

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// The independent keyspaces an identity can be tracked in.
///
/// Records are never shared or aliased across namespaces: the IP `"alice"` and the
/// username `"alice"` are unrelated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    /// Keyed by client IP address
    Ip,
    /// Keyed by the username being authenticated
    Username,
}

impl Namespace {
    pub const ALL: [Namespace; 2] = [Namespace::Ip, Namespace::Username];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Ip => "ip",
            Namespace::Username => "username",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ip" => Ok(Namespace::Ip),
            "username" | "user" => Ok(Namespace::Username),
            other => Err(ValidationError::InvalidField(format!(
                "unknown namespace: {other}"
            ))),
        }
    }
}

/// Failure history for a single identity.
///
/// A record only exists while it has at least one failure; a recorded success
/// removes it, so `failure_count == 0` never coexists with a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub identity: String,
    pub failure_count: u32,
    pub first_failure_at: DateTime<Utc>,
    pub last_failure_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
}

impl AttemptRecord {
    /// Start a fresh run of failures at `now`.
    pub fn first_failure(identity: &str, now: DateTime<Utc>) -> Self {
        Self {
            identity: identity.to_string(),
            failure_count: 1,
            first_failure_at: now,
            last_failure_at: now,
            locked_until: None,
        }
    }

    /// Whether the lock, if any, is still in force at `now`.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    /// Whether the record carries a lock that has already run out.
    pub fn lock_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until <= now)
    }
}

/// An attempt record together with its store-assigned version.
///
/// The version increases on every successful write and backs the
/// compare-and-swap contract of [`AttemptRepository`](crate::repositories::AttemptRepository).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttempt {
    pub record: AttemptRecord,
    pub version: u64,
}

/// Result of an atomic read-modify-write on a single identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptUpdate {
    /// The record as it was observed right before the write
    pub previous: Option<AttemptRecord>,
    /// The record as written
    pub current: AttemptRecord,
}

impl AttemptUpdate {
    /// True when this write moved the identity from unlocked to locked.
    pub fn newly_locked(&self, now: DateTime<Utc>) -> bool {
        self.current.is_locked_at(now)
            && !self
                .previous
                .as_ref()
                .is_some_and(|previous| previous.is_locked_at(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_namespace_round_trip_through_str() {
        for namespace in Namespace::ALL {
            assert_eq!(namespace.as_str().parse::<Namespace>().unwrap(), namespace);
        }
        assert_eq!("user".parse::<Namespace>().unwrap(), Namespace::Username);
        assert!("email".parse::<Namespace>().is_err());
    }

    #[test]
    fn test_first_failure_is_unlocked() {
        let now = Utc::now();
        let record = AttemptRecord::first_failure("1.2.3.4", now);

        assert_eq!(record.failure_count, 1);
        assert_eq!(record.first_failure_at, now);
        assert_eq!(record.last_failure_at, now);
        assert!(!record.is_locked_at(now));
        assert!(!record.lock_expired_at(now));
    }

    #[test]
    fn test_lock_boundaries() {
        let now = Utc::now();
        let mut record = AttemptRecord::first_failure("alice", now);
        record.locked_until = Some(now + Duration::seconds(60));

        assert!(record.is_locked_at(now));
        assert!(record.is_locked_at(now + Duration::seconds(59)));
        assert!(!record.is_locked_at(now + Duration::seconds(60)));
        assert!(record.lock_expired_at(now + Duration::seconds(60)));
    }

    #[test]
    fn test_newly_locked_only_on_transition() {
        let now = Utc::now();
        let unlocked = AttemptRecord::first_failure("alice", now);
        let mut locked = unlocked.clone();
        locked.locked_until = Some(now + Duration::minutes(1));

        let transition = AttemptUpdate {
            previous: Some(unlocked),
            current: locked.clone(),
        };
        assert!(transition.newly_locked(now));

        let still_locked = AttemptUpdate {
            previous: Some(locked.clone()),
            current: locked,
        };
        assert!(!still_locked.newly_locked(now));
    }
}
