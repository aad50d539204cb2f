//! Attempt tracking with progressive delay and lockout.
//!
//! [`AttemptTracker`] ties an [`AttemptRepository`] to a [`ThrottlePolicy`]:
//! checks are read-only, and every recorded failure goes through the store's
//! atomic update so that concurrent failures on one identity are each counted
//! exactly once.
//!
//! # Example
//!
//! ```rust,ignore
//! use portcullis_core::{attempt::Namespace, services::AttemptTracker};
//!
//! let tracker = AttemptTracker::new(repository, policy);
//!
//! let decision = tracker.check_identity(Namespace::Ip, "1.2.3.4", now).await?;
//! if decision.locked {
//!     // Reject before touching credentials
//! }
//!
//! tracker.record_failure(Namespace::Ip, "1.2.3.4", now).await?;
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    Error,
    attempt::{AttemptRecord, Namespace},
    clock::{Clock, SystemClock},
    config::ThrottleConfig,
    error::ValidationError,
    events::{Event, EventBus, UnlockReason},
    policy::{ThrottleDecision, ThrottlePolicy},
    repositories::AttemptRepository,
};

/// The only message shown to a client whose credentials were rejected.
pub const SAFE_ERROR_MESSAGE: &str = "Invalid username or password";

fn out_of_range(setting: &str, now: DateTime<Utc>) -> Error {
    tracing::error!(setting, %now, "Configured duration leaves the timestamp range");
    ValidationError::InvalidConfiguration(format!("{setting} is out of range at {now}")).into()
}

/// Tracks failures per identity and decides delays and lockouts.
///
/// The tracker is cheap to clone and can be shared across tasks; all state
/// lives in the repository.
pub struct AttemptTracker<R: AttemptRepository> {
    repository: Arc<R>,
    policy: ThrottlePolicy,
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
}

impl<R: AttemptRepository> Clone for AttemptTracker<R> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            policy: self.policy.clone(),
            clock: Arc::clone(&self.clock),
            event_bus: self.event_bus.clone(),
        }
    }
}

impl<R: AttemptRepository> AttemptTracker<R> {
    pub fn new(repository: Arc<R>, policy: ThrottlePolicy) -> Self {
        Self {
            repository,
            policy,
            clock: Arc::new(SystemClock),
            event_bus: EventBus::default(),
        }
    }

    /// Use `clock` for background sweeps and for callers that ask the tracker for the time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    pub fn policy(&self) -> &ThrottlePolicy {
        &self.policy
    }

    pub fn config(&self) -> &ThrottleConfig {
        self.policy.config()
    }

    pub fn is_enabled(&self) -> bool {
        self.policy.is_enabled()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Evaluate an identity without changing its record.
    ///
    /// Storage errors are returned to the caller.
    pub async fn check_identity(
        &self,
        namespace: Namespace,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<ThrottleDecision, Error> {
        if !self.policy.is_enabled() {
            return Ok(ThrottleDecision::allow());
        }

        let stored = self.repository.find(namespace, identity).await?;
        Ok(self
            .policy
            .evaluate(stored.as_ref().map(|stored| &stored.record), now))
    }

    /// Record a failed attempt and return the identity's decision afterwards.
    ///
    /// A stale or absent record starts a fresh run. Reaching
    /// `max_attempts_before_lock` sets `locked_until = now + lock_duration`.
    /// If protection is disabled this is a no-op.
    pub async fn record_failure(
        &self,
        namespace: Namespace,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<ThrottleDecision, Error> {
        if !self.policy.is_enabled() {
            return Ok(ThrottleDecision::allow());
        }

        let policy = &self.policy;
        let max_attempts_before_lock = policy.config().max_attempts_before_lock;
        let lock_until = now
            .checked_add_signed(policy.lock_duration())
            .ok_or_else(|| out_of_range("lock_duration", now))?;

        let apply = |previous: Option<&AttemptRecord>| {
            let mut record = match previous {
                Some(previous) if !policy.is_stale(previous, now) => AttemptRecord {
                    failure_count: previous.failure_count.saturating_add(1),
                    last_failure_at: now,
                    ..previous.clone()
                },
                _ => AttemptRecord::first_failure(identity, now),
            };
            if record.failure_count >= max_attempts_before_lock {
                record.locked_until = Some(lock_until);
            }
            record
        };

        let update = self.repository.update(namespace, identity, &apply).await?;

        if update.newly_locked(now) {
            let locked_until = update.current.locked_until.unwrap_or(now);
            tracing::info!(
                namespace = %namespace,
                identity,
                failure_count = update.current.failure_count,
                locked_until = %locked_until,
                "Identity locked after repeated failures"
            );
            self.event_bus
                .publish(&Event::IdentityLocked {
                    namespace,
                    identity: identity.to_string(),
                    failure_count: update.current.failure_count,
                    locked_until,
                    timestamp: now,
                })
                .await;
        } else {
            tracing::debug!(
                namespace = %namespace,
                identity,
                failure_count = update.current.failure_count,
                "Recorded failed attempt"
            );
        }

        Ok(self.policy.evaluate(Some(&update.current), now))
    }

    /// Clear the record for an identity. Calling it on a clear identity is a no-op.
    pub async fn record_success(&self, namespace: Namespace, identity: &str) -> Result<(), Error> {
        if let Some(previous) = self.repository.remove(namespace, identity).await? {
            tracing::debug!(
                namespace = %namespace,
                identity,
                cleared_failures = previous.failure_count,
                "Cleared attempt record after success"
            );
        }
        Ok(())
    }

    /// The fixed message for every rejected credential, whatever the cause.
    pub fn safe_error_message() -> &'static str {
        SAFE_ERROR_MESSAGE
    }

    /// Remove an identity's record as an administrative action.
    ///
    /// Returns `true` if the identity was locked at `now`.
    pub async fn unlock(
        &self,
        namespace: Namespace,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        self.unlock_with_reason(namespace, identity, now, UnlockReason::AdminAction)
            .await
    }

    /// Remove an identity's record, reporting `reason` if a lock was lifted.
    pub async fn unlock_with_reason(
        &self,
        namespace: Namespace,
        identity: &str,
        now: DateTime<Utc>,
        reason: UnlockReason,
    ) -> Result<bool, Error> {
        let removed = self.repository.remove(namespace, identity).await?;
        let was_locked = removed.is_some_and(|record| record.is_locked_at(now));

        if was_locked {
            tracing::info!(
                namespace = %namespace,
                identity,
                reason = ?reason,
                "Identity unlocked"
            );
            self.event_bus
                .publish(&Event::IdentityUnlocked {
                    namespace,
                    identity: identity.to_string(),
                    reason,
                    timestamp: now,
                })
                .await;
        }

        Ok(was_locked)
    }

    /// Delete records that no longer affect any decision.
    ///
    /// Safe to run while logins are in flight: a record removed under a
    /// concurrent update is simply recreated by that update.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        let cutoff = now
            .checked_sub_signed(self.policy.attempt_window())
            .ok_or_else(|| out_of_range("attempt_window", now))?;
        self.repository.remove_stale(cutoff, now).await
    }

    /// Start the background sweep task.
    ///
    /// Runs [`sweep`](Self::sweep) every `sweep_interval` until `shutdown`
    /// changes or its sender is dropped.
    pub fn start_sweep_task(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let tracker = self.clone();
        let period = self.config().sweep_interval;

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(period);

            loop {
                tokio::select! {
                    _ = interval_timer.tick() => {
                        match tracker.sweep(tracker.now()).await {
                            Ok(count) if count > 0 => {
                                tracing::info!(count, "Swept stale attempt records");
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Failed to sweep attempt records");
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown.changed() => {
                        tracing::info!("Shutting down attempt sweep task");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        attempt::{AttemptUpdate, StoredAttempt},
        clock::ManualClock,
        config::MAX_TRACKING_DURATION,
        error::{AuthError, EventError, StorageError},
        events::EventHandler,
        repositories::{AttemptMutation, InMemoryAttemptStore},
    };
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::Mutex;
    use std::time::Duration as StdDuration;

    fn config() -> ThrottleConfig {
        ThrottleConfig::default()
            .with_max_attempts_before_delay(3)
            .with_max_attempts_before_lock(5)
            .with_lock_duration(StdDuration::from_secs(60))
            .with_attempt_window(StdDuration::from_secs(300))
    }

    fn tracker_with(config: ThrottleConfig) -> AttemptTracker<InMemoryAttemptStore> {
        AttemptTracker::new(
            Arc::new(InMemoryAttemptStore::new()),
            ThrottlePolicy::new(config).unwrap(),
        )
    }

    fn tracker() -> AttemptTracker<InMemoryAttemptStore> {
        tracker_with(config())
    }

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle_event(&self, event: &Event) -> Result<(), EventError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lock_past_the_end_of_time_is_an_error() {
        let tracker = tracker_with(config().with_lock_duration(MAX_TRACKING_DURATION));
        let now = DateTime::<Utc>::MAX_UTC - Duration::days(1);

        let result = tracker.record_failure(Namespace::Ip, "1.2.3.4", now).await;
        assert!(result.unwrap_err().is_validation_error());
        // Nothing was written
        assert!(
            tracker
                .repository()
                .find(Namespace::Ip, "1.2.3.4")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_sweep_before_the_start_of_time_is_an_error() {
        let tracker = tracker_with(config().with_attempt_window(MAX_TRACKING_DURATION));
        let now = DateTime::<Utc>::MIN_UTC + Duration::days(1);

        assert!(tracker.sweep(now).await.unwrap_err().is_validation_error());
    }

    #[tokio::test]
    async fn test_locks_after_max_failures() {
        let tracker = tracker();
        let now = Utc::now();

        for _ in 0..4 {
            let decision = tracker
                .record_failure(Namespace::Username, "alice", now)
                .await
                .unwrap();
            assert!(!decision.locked);
        }
        let decision = tracker
            .record_failure(Namespace::Username, "alice", now)
            .await
            .unwrap();
        assert!(decision.locked);

        let checked = tracker
            .check_identity(Namespace::Username, "alice", now)
            .await
            .unwrap();
        assert!(checked.locked);
        assert!(checked.remaining_lock_seconds > 0);
        assert!(checked.remaining_lock_seconds <= 60);
    }

    #[tokio::test]
    async fn test_check_is_read_only() {
        let tracker = tracker();
        let now = Utc::now();
        tracker
            .record_failure(Namespace::Ip, "1.2.3.4", now)
            .await
            .unwrap();

        for _ in 0..10 {
            let decision = tracker
                .check_identity(Namespace::Ip, "1.2.3.4", now)
                .await
                .unwrap();
            assert_eq!(decision.failure_count, 1);
        }
    }

    #[tokio::test]
    async fn test_success_resets_any_history() {
        let tracker = tracker();
        let now = Utc::now();
        for _ in 0..5 {
            tracker
                .record_failure(Namespace::Username, "alice", now)
                .await
                .unwrap();
        }

        tracker
            .record_success(Namespace::Username, "alice")
            .await
            .unwrap();

        let decision = tracker
            .check_identity(Namespace::Username, "alice", now)
            .await
            .unwrap();
        assert_eq!(decision, ThrottleDecision::allow());
        assert!(
            tracker
                .repository()
                .find(Namespace::Username, "alice")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_record_success_is_idempotent() {
        let tracker = tracker();

        tracker
            .record_success(Namespace::Ip, "1.2.3.4")
            .await
            .unwrap();
        tracker
            .record_success(Namespace::Ip, "1.2.3.4")
            .await
            .unwrap();

        assert!(tracker.repository().is_empty());
    }

    #[tokio::test]
    async fn test_delay_starts_at_threshold() {
        let tracker = tracker();
        let now = Utc::now();

        let mut delays = Vec::new();
        for _ in 0..4 {
            let decision = tracker
                .record_failure(Namespace::Username, "bob", now)
                .await
                .unwrap();
            delays.push(decision.delay);
        }

        assert_eq!(delays[0], StdDuration::ZERO);
        assert_eq!(delays[1], StdDuration::ZERO);
        assert!(delays[2] > StdDuration::ZERO);
        assert!(delays[3] >= delays[2]);
    }

    #[tokio::test]
    async fn test_stale_record_starts_fresh_run() {
        let tracker = tracker();
        let start = Utc::now();
        for _ in 0..4 {
            tracker
                .record_failure(Namespace::Username, "alice", start)
                .await
                .unwrap();
        }

        let later = start + Duration::seconds(301);
        let decision = tracker
            .check_identity(Namespace::Username, "alice", later)
            .await
            .unwrap();
        assert_eq!(decision.failure_count, 0);

        tracker
            .record_failure(Namespace::Username, "alice", later)
            .await
            .unwrap();
        let stored = tracker
            .repository()
            .find(Namespace::Username, "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.record.failure_count, 1);
        assert_eq!(stored.record.first_failure_at, later);
    }

    #[tokio::test]
    async fn test_expired_lock_starts_fresh_run() {
        let tracker = tracker();
        let start = Utc::now();
        for _ in 0..5 {
            tracker
                .record_failure(Namespace::Username, "alice", start)
                .await
                .unwrap();
        }

        let after_lock = start + Duration::seconds(61);
        let decision = tracker
            .check_identity(Namespace::Username, "alice", after_lock)
            .await
            .unwrap();
        assert!(!decision.locked);
        assert_eq!(decision.failure_count, 0);

        let decision = tracker
            .record_failure(Namespace::Username, "alice", after_lock)
            .await
            .unwrap();
        assert!(!decision.locked);
        assert_eq!(decision.failure_count, 1);
    }

    #[tokio::test]
    async fn test_namespaces_do_not_alias() {
        let tracker = tracker();
        let now = Utc::now();
        for _ in 0..5 {
            tracker
                .record_failure(Namespace::Username, "alice", now)
                .await
                .unwrap();
        }

        let ip = tracker
            .check_identity(Namespace::Ip, "alice", now)
            .await
            .unwrap();
        assert!(!ip.locked);
        assert_eq!(ip.failure_count, 0);
    }

    #[tokio::test]
    async fn test_disabled_tracker_never_records() {
        let tracker = tracker_with(ThrottleConfig::disabled());
        let now = Utc::now();

        for _ in 0..10 {
            let decision = tracker
                .record_failure(Namespace::Ip, "1.2.3.4", now)
                .await
                .unwrap();
            assert!(decision.is_allowed());
        }
        assert!(tracker.repository().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_failures_are_all_counted() {
        const N: u32 = 64;
        let tracker = tracker_with(config().with_max_attempts_before_lock(1_000));
        let now = Utc::now();

        let handles: Vec<_> = (0..N)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    tracker
                        .record_failure(Namespace::Username, "alice", now)
                        .await
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let stored = tracker
            .repository()
            .find(Namespace::Username, "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.record.failure_count, N);
    }

    #[tokio::test]
    async fn test_lock_event_emitted_once() {
        let handler = Arc::new(RecordingHandler::default());
        let bus = EventBus::default();
        bus.register(handler.clone()).await;
        let tracker = tracker().with_event_bus(bus);
        let now = Utc::now();

        for _ in 0..7 {
            tracker
                .record_failure(Namespace::Ip, "1.2.3.4", now)
                .await
                .unwrap();
        }

        let events = handler.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            Event::IdentityLocked { namespace: Namespace::Ip, failure_count: 5, .. }
        ));
    }

    #[tokio::test]
    async fn test_unlock_reports_whether_locked() {
        let handler = Arc::new(RecordingHandler::default());
        let bus = EventBus::default();
        bus.register(handler.clone()).await;
        let tracker = tracker().with_event_bus(bus);
        let now = Utc::now();

        tracker
            .record_failure(Namespace::Username, "carol", now)
            .await
            .unwrap();
        assert!(
            !tracker
                .unlock(Namespace::Username, "carol", now)
                .await
                .unwrap()
        );

        for _ in 0..5 {
            tracker
                .record_failure(Namespace::Username, "carol", now)
                .await
                .unwrap();
        }
        handler.events.lock().unwrap().clear();

        assert!(
            tracker
                .unlock(Namespace::Username, "carol", now)
                .await
                .unwrap()
        );
        let decision = tracker
            .check_identity(Namespace::Username, "carol", now)
            .await
            .unwrap();
        assert!(!decision.locked);

        let events = handler.events.lock().unwrap();
        assert!(matches!(
            &events[..],
            [Event::IdentityUnlocked {
                reason: UnlockReason::AdminAction,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn test_sweep_removes_only_stale_records() {
        let tracker = tracker();
        let start = Utc::now();

        tracker
            .record_failure(Namespace::Ip, "10.0.0.1", start)
            .await
            .unwrap();
        for _ in 0..5 {
            tracker
                .record_failure(Namespace::Username, "dave", start + Duration::seconds(290))
                .await
                .unwrap();
        }

        let removed = tracker.sweep(start + Duration::seconds(301)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(tracker.repository().len(Namespace::Ip), 0);
        assert_eq!(tracker.repository().len(Namespace::Username), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_task_stops_on_shutdown() {
        let clock = Arc::new(ManualClock::default());
        let tracker = tracker_with(config().with_sweep_interval(StdDuration::from_secs(10)))
            .with_clock(clock.clone());
        tracker
            .record_failure(Namespace::Ip, "10.0.0.1", clock.now())
            .await
            .unwrap();
        clock.advance(Duration::seconds(301));

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = tracker.start_sweep_task(shutdown_rx);

        tokio::time::sleep(StdDuration::from_secs(1)).await;
        assert!(tracker.repository().is_empty());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_safe_error_message_matches_auth_error() {
        assert_eq!(
            AttemptTracker::<InMemoryAttemptStore>::safe_error_message(),
            AuthError::InvalidCredentials.to_string()
        );
    }

    /// Store whose reads fail, to check errors surface instead of being swallowed.
    struct FailingStore;

    #[async_trait]
    impl AttemptRepository for FailingStore {
        async fn find(&self, _: Namespace, _: &str) -> Result<Option<StoredAttempt>, Error> {
            Err(StorageError::Connection("unreachable".to_string()).into())
        }

        async fn compare_and_swap(
            &self,
            _: Namespace,
            _: &str,
            _: Option<u64>,
            _: &AttemptRecord,
        ) -> Result<bool, Error> {
            Err(StorageError::Connection("unreachable".to_string()).into())
        }

        async fn update(
            &self,
            _: Namespace,
            _: &str,
            _: AttemptMutation<'_>,
        ) -> Result<AttemptUpdate, Error> {
            Err(StorageError::Connection("unreachable".to_string()).into())
        }

        async fn remove(&self, _: Namespace, _: &str) -> Result<Option<AttemptRecord>, Error> {
            Err(StorageError::Connection("unreachable".to_string()).into())
        }

        async fn remove_stale(&self, _: DateTime<Utc>, _: DateTime<Utc>) -> Result<u64, Error> {
            Err(StorageError::Connection("unreachable".to_string()).into())
        }
    }

    #[tokio::test]
    async fn test_storage_errors_surface() {
        let tracker = AttemptTracker::new(
            Arc::new(FailingStore),
            ThrottlePolicy::new(config()).unwrap(),
        );
        let now = Utc::now();

        assert!(
            tracker
                .check_identity(Namespace::Ip, "1.2.3.4", now)
                .await
                .unwrap_err()
                .is_storage_error()
        );
        assert!(
            tracker
                .record_failure(Namespace::Ip, "1.2.3.4", now)
                .await
                .unwrap_err()
                .is_storage_error()
        );
    }
}
