//! Read-only throttling decisions.
//!
//! [`ThrottlePolicy::evaluate`] maps an attempt record snapshot and the current
//! time to a [`ThrottleDecision`]. It never writes, so it can be called once per
//! namespace on every request without double counting. Transitions into the
//! locked state happen when a failure is recorded, in
//! [`AttemptTracker`](crate::services::AttemptTracker).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{Error, attempt::AttemptRecord, config::ThrottleConfig, error::ValidationError};

/// Outcome of evaluating one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThrottleDecision {
    pub locked: bool,
    /// Whole seconds until the lock lifts, rounded up. Zero when not locked.
    pub remaining_lock_seconds: u64,
    /// Slow-down to apply before touching credentials. Meaningless when locked.
    pub delay: Duration,
    /// Failures counted against the identity after the staleness rule
    pub failure_count: u32,
}

impl ThrottleDecision {
    pub fn allow() -> Self {
        Self {
            locked: false,
            remaining_lock_seconds: 0,
            delay: Duration::ZERO,
            failure_count: 0,
        }
    }

    pub fn is_allowed(&self) -> bool {
        !self.locked
    }
}

/// Pure decision function parameterized by a validated [`ThrottleConfig`].
#[derive(Debug, Clone)]
pub struct ThrottlePolicy {
    config: ThrottleConfig,
    lock_duration: chrono::Duration,
    attempt_window: chrono::Duration,
}

impl ThrottlePolicy {
    pub fn new(config: ThrottleConfig) -> Result<Self, Error> {
        config.validate()?;

        let lock_duration = chrono::Duration::from_std(config.lock_duration).map_err(|_| {
            ValidationError::InvalidConfiguration("lock_duration is out of range".to_string())
        })?;
        let attempt_window = chrono::Duration::from_std(config.attempt_window).map_err(|_| {
            ValidationError::InvalidConfiguration("attempt_window is out of range".to_string())
        })?;

        Ok(Self {
            config,
            lock_duration,
            attempt_window,
        })
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn lock_duration(&self) -> chrono::Duration {
        self.lock_duration
    }

    pub fn attempt_window(&self) -> chrono::Duration {
        self.attempt_window
    }

    /// Whether a record should be read as if it had no failures.
    ///
    /// A lock in force is never stale. An expired lock always is, so the
    /// identity starts over with a fresh run once its lockout has been served.
    /// Otherwise a record goes stale once its last failure leaves the window.
    pub fn is_stale(&self, record: &AttemptRecord, now: DateTime<Utc>) -> bool {
        if record.is_locked_at(now) {
            return false;
        }
        if record.lock_expired_at(now) {
            return true;
        }
        now - record.last_failure_at > self.attempt_window
    }

    /// Failures that count against the identity at `now`.
    pub fn effective_failures(&self, record: Option<&AttemptRecord>, now: DateTime<Utc>) -> u32 {
        match record {
            Some(record) if !self.is_stale(record, now) => record.failure_count,
            _ => 0,
        }
    }

    /// Progressive delay for a failure count, capped at `max_delay`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures < self.config.max_attempts_before_delay {
            return Duration::ZERO;
        }
        let excess = failures - self.config.max_attempts_before_delay + 1;
        self.config
            .delay_schedule
            .delay_for(excess)
            .min(self.config.max_delay)
    }

    pub fn evaluate(&self, record: Option<&AttemptRecord>, now: DateTime<Utc>) -> ThrottleDecision {
        if !self.config.enabled {
            return ThrottleDecision::allow();
        }

        let Some(record) = record else {
            return ThrottleDecision::allow();
        };

        if let Some(until) = record.locked_until {
            if until > now {
                return ThrottleDecision {
                    locked: true,
                    remaining_lock_seconds: ceil_seconds(until - now),
                    delay: Duration::ZERO,
                    failure_count: record.failure_count,
                };
            }
        }

        // An expired lock lands here too and is read through the staleness rule.
        let failures = self.effective_failures(Some(record), now);
        ThrottleDecision {
            locked: false,
            remaining_lock_seconds: 0,
            delay: self.delay_for(failures),
            failure_count: failures,
        }
    }
}

fn ceil_seconds(remaining: chrono::Duration) -> u64 {
    let millis = remaining.num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}
