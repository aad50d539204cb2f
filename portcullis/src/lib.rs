//! # Portcullis
//!
//! Portcullis guards a password login against brute-force and credential
//! stuffing attacks. Every attempt is tracked twice, by client address and by
//! username, and each identity progresses through three stages:
//!
//! - a few free failures,
//! - a progressive delay before credentials are checked,
//! - a time-bounded lockout during which attempts are rejected outright.
//!
//! Responses never reveal whether a username exists: a wrong password and an
//! unknown user produce the same message and take the same time.
//!
//! ## Storage Support
//!
//! - In-memory (single process)
//! - SQLite
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use portcullis::{JwtConfig, LoginOutcome, Portcullis, UserRepository};
//!
//! # async fn example(users: Arc<dyn UserRepository>) -> Result<(), Box<dyn std::error::Error>> {
//! let portcullis = Portcullis::builder()
//!     .with_memory_store()
//!     .with_jwt(JwtConfig::new_hs256(b"a long random secret".to_vec()))
//!     .build(users)
//!     .await?;
//!
//! match portcullis.attempt_login("alice", "hunter2", "203.0.113.7").await {
//!     LoginOutcome::Accepted { token, .. } => println!("token: {}", token.token),
//!     other => println!("{}", other.message().unwrap_or_default()),
//! }
//! # Ok(())
//! # }
//! ```
mod builder;

use chrono::{DateTime, Utc};
use portcullis_core::{AttemptTracker, LoginService};

pub use builder::{NoStorage, PortcullisBuilder, PortcullisBuilderError, WithStorage};

/// Re-export core types from portcullis_core
pub use portcullis_core::{
    AccessGrant, Argon2PasswordVerifier, AttemptRecord, AttemptRepository, Clock, DelaySchedule,
    DelayStep, Error, Event, EventHandler, InMemoryAttemptStore, IssuedToken, JwtConfig, JwtTokenIssuer,
    LoginOutcome, ManualClock, Namespace, PasswordVerifier, Principal, SystemClock,
    ThrottleConfig, ThrottleDecision, TokenIssuer, UnlockReason, User, UserId, UserRepository,
    calibrate_dummy_cost,
};

/// Re-export storage backends
#[cfg(feature = "sqlite")]
pub use portcullis_storage_sqlite::{SqliteAttemptRepository, SqlitePool};

/// Errors from the administrative and lifecycle operations.
///
/// Login attempts never return this: they always end in a [`LoginOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum PortcullisError {
    /// Error when interacting with storage
    #[error("Storage error: {0}")]
    StorageError(String),
}

/// Brute-force protected login.
pub struct Portcullis<R: AttemptRepository> {
    login: LoginService<R>,
}

impl Portcullis<InMemoryAttemptStore> {
    pub fn builder() -> PortcullisBuilder<NoStorage> {
        PortcullisBuilder::new()
    }
}

impl<R: AttemptRepository> Portcullis<R> {
    pub(crate) fn from_login_service(login: LoginService<R>) -> Self {
        Self { login }
    }

    pub fn tracker(&self) -> &AttemptTracker<R> {
        self.login.tracker()
    }

    pub fn config(&self) -> &ThrottleConfig {
        self.login.tracker().config()
    }

    /// Run the storage backend's migrations.
    pub async fn migrate(&self) -> Result<(), PortcullisError> {
        self.tracker()
            .repository()
            .migrate()
            .await
            .map_err(|e| PortcullisError::StorageError(e.to_string()))
    }

    pub async fn health_check(&self) -> Result<(), PortcullisError> {
        self.tracker()
            .repository()
            .health_check()
            .await
            .map_err(|e| PortcullisError::StorageError(e.to_string()))
    }

    /// Attempt a password login from `client_ip`.
    pub async fn attempt_login(
        &self,
        username: &str,
        password: &str,
        client_ip: &str,
    ) -> LoginOutcome {
        self.login.attempt_login(username, password, client_ip).await
    }

    /// Attempt a login as if it happened at `now`.
    pub async fn attempt_login_at(
        &self,
        username: &str,
        password: &str,
        client_ip: &str,
        now: DateTime<Utc>,
    ) -> LoginOutcome {
        self.login
            .attempt_login_at(username, password, client_ip, now)
            .await
    }

    /// Current decision for a client address. Does not count as an attempt.
    pub async fn check_ip(&self, client_ip: &str) -> Result<ThrottleDecision, PortcullisError> {
        self.check(Namespace::Ip, client_ip).await
    }

    /// Current decision for a username. Does not count as an attempt.
    pub async fn check_username(
        &self,
        username: &str,
    ) -> Result<ThrottleDecision, PortcullisError> {
        self.check(Namespace::Username, username).await
    }

    async fn check(
        &self,
        namespace: Namespace,
        identity: &str,
    ) -> Result<ThrottleDecision, PortcullisError> {
        let tracker = self.tracker();
        tracker
            .check_identity(namespace, identity, tracker.now())
            .await
            .map_err(|e| PortcullisError::StorageError(e.to_string()))
    }

    /// Clear an identity's record. Returns `true` if a lock was lifted.
    pub async fn unlock(
        &self,
        namespace: Namespace,
        identity: &str,
    ) -> Result<bool, PortcullisError> {
        let tracker = self.tracker();
        tracker
            .unlock(namespace, identity, tracker.now())
            .await
            .map_err(|e| PortcullisError::StorageError(e.to_string()))
    }

    /// Remove records that no longer affect any decision.
    pub async fn sweep(&self) -> Result<u64, PortcullisError> {
        let tracker = self.tracker();
        tracker
            .sweep(tracker.now())
            .await
            .map_err(|e| PortcullisError::StorageError(e.to_string()))
    }

    /// Sweep every `sweep_interval` until `shutdown` fires.
    pub fn start_sweep_task(
        &self,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        self.tracker().start_sweep_task(shutdown)
    }
}
