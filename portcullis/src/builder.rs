//! Builder pattern for constructing Portcullis instances
//!
//! This module provides a type-safe builder for creating [`Portcullis`] instances with
//! compile-time validation of storage configuration.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use portcullis::{JwtConfig, PortcullisBuilder, UserRepository};
//!
//! # async fn example(users: Arc<dyn UserRepository>) -> Result<(), Box<dyn std::error::Error>> {
//! let portcullis = PortcullisBuilder::new()
//!     .with_sqlite("sqlite://portcullis.db")
//!     .await?
//!     .with_jwt(JwtConfig::new_hs256(b"a long random secret".to_vec()))
//!     .apply_migrations(true)
//!     .build(users)
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use portcullis_core::{
    Argon2PasswordVerifier, AttemptRepository, AttemptTracker, Clock, EventBus, EventHandler,
    InMemoryAttemptStore, JwtConfig, JwtTokenIssuer, LoginService, PasswordVerifier,
    SystemClock, ThrottleConfig, ThrottlePolicy, TokenIssuer, UserRepository,
    error::utilities::RequiredFieldExt,
};

use crate::Portcullis;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur when building a Portcullis instance.
#[derive(Debug, thiserror::Error)]
pub enum PortcullisBuilderError {
    /// Failed to connect to storage backend
    #[error("Storage connection failed: {0}")]
    StorageConnection(String),

    /// Failed to run database migrations
    #[error("Migration failed: {0}")]
    Migration(String),

    /// Invalid configuration provided
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

// ============================================================================
// Type-State Markers
// ============================================================================

/// Marker type indicating no storage has been configured yet.
///
/// This is the initial state of [`PortcullisBuilder`].
pub struct NoStorage;

/// Marker type indicating storage has been configured.
pub struct WithStorage<R: AttemptRepository> {
    repository: Arc<R>,
}

// ============================================================================
// Builder Implementation
// ============================================================================

/// A type-safe builder for constructing [`Portcullis`] instances.
///
/// # Type States
///
/// - [`NoStorage`]: Initial state, storage must be configured
/// - [`WithStorage<R>`]: Storage configured, ready to build or add more configuration
pub struct PortcullisBuilder<Storage> {
    storage: Storage,
    throttle_config: ThrottleConfig,
    verifier: Arc<dyn PasswordVerifier>,
    token_issuer: Option<Arc<dyn TokenIssuer>>,
    clock: Arc<dyn Clock>,
    event_handlers: Vec<Arc<dyn EventHandler>>,
    apply_migrations: bool,
}

impl Default for PortcullisBuilder<NoStorage> {
    fn default() -> Self {
        Self::new()
    }
}

impl PortcullisBuilder<NoStorage> {
    /// Create a new builder with default configuration.
    ///
    /// # Defaults
    ///
    /// - Throttling: [`ThrottleConfig::default`] (delay after 3 failures, lock after 5 for 15 minutes)
    /// - Password verifier: Argon2 via `password-auth`
    /// - Clock: system clock
    /// - Apply migrations: false
    pub fn new() -> Self {
        Self {
            storage: NoStorage,
            throttle_config: ThrottleConfig::default(),
            verifier: Arc::new(Argon2PasswordVerifier::new()),
            token_issuer: None,
            clock: Arc::new(SystemClock),
            event_handlers: Vec::new(),
            apply_migrations: false,
        }
    }

    /// Keep attempt records in process memory.
    ///
    /// Records do not survive a restart and are not shared between processes.
    pub fn with_memory_store(self) -> PortcullisBuilder<WithStorage<InMemoryAttemptStore>> {
        self.with_repository(Arc::new(InMemoryAttemptStore::new()))
    }

    /// Use any [`AttemptRepository`] implementation.
    pub fn with_repository<R: AttemptRepository>(
        self,
        repository: Arc<R>,
    ) -> PortcullisBuilder<WithStorage<R>> {
        PortcullisBuilder {
            storage: WithStorage { repository },
            throttle_config: self.throttle_config,
            verifier: self.verifier,
            token_issuer: self.token_issuer,
            clock: self.clock,
            event_handlers: self.event_handlers,
            apply_migrations: self.apply_migrations,
        }
    }
}

#[cfg(feature = "sqlite")]
impl PortcullisBuilder<NoStorage> {
    /// Configure SQLite storage by connecting to the given URL.
    ///
    /// # Arguments
    ///
    /// * `url` - SQLite connection URL (e.g., "sqlite::memory:" or "sqlite://path/to/db.sqlite")
    pub async fn with_sqlite(
        self,
        url: &str,
    ) -> Result<PortcullisBuilder<WithStorage<crate::SqliteAttemptRepository>>, PortcullisBuilderError>
    {
        let repository = crate::SqliteAttemptRepository::connect(url)
            .await
            .map_err(|e| PortcullisBuilderError::StorageConnection(e.to_string()))?;

        Ok(self.with_repository(Arc::new(repository)))
    }

    /// Configure SQLite storage with an existing connection pool.
    pub fn with_sqlite_pool(
        self,
        pool: crate::SqlitePool,
    ) -> PortcullisBuilder<WithStorage<crate::SqliteAttemptRepository>> {
        self.with_repository(Arc::new(crate::SqliteAttemptRepository::new(pool)))
    }
}

// ============================================================================
// Configuration Methods (available after storage is configured)
// ============================================================================

impl<R: AttemptRepository> PortcullisBuilder<WithStorage<R>> {
    /// Set thresholds, delays and lock duration.
    pub fn with_throttle_config(mut self, config: ThrottleConfig) -> Self {
        self.throttle_config = config;
        self
    }

    /// Read thresholds from `PORTCULLIS_*` environment variables.
    ///
    /// See [`ThrottleConfig::from_env`] for the variables read.
    pub fn with_throttle_config_from_env(mut self) -> Result<Self, PortcullisBuilderError> {
        self.throttle_config = ThrottleConfig::from_env()
            .map_err(|e| PortcullisBuilderError::InvalidConfiguration(e.to_string()))?;
        Ok(self)
    }

    /// Replace the default Argon2 verifier.
    pub fn with_password_verifier(mut self, verifier: Arc<dyn PasswordVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Issue JWTs for accepted logins.
    pub fn with_jwt(mut self, config: JwtConfig) -> Self {
        self.token_issuer = Some(Arc::new(JwtTokenIssuer::new(config)));
        self
    }

    /// Issue credentials with a custom [`TokenIssuer`].
    pub fn with_token_issuer(mut self, issuer: Arc<dyn TokenIssuer>) -> Self {
        self.token_issuer = Some(issuer);
        self
    }

    /// Replace the system clock, mostly useful in tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a handler for security events.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handlers.push(handler);
        self
    }

    /// Set whether to automatically apply database migrations during build.
    ///
    /// Default: false
    pub fn apply_migrations(mut self, apply: bool) -> Self {
        self.apply_migrations = apply;
        self
    }

    /// Build the Portcullis instance.
    ///
    /// `users` is the host application's user lookup. A token issuer must
    /// have been configured with [`with_jwt`](Self::with_jwt) or
    /// [`with_token_issuer`](Self::with_token_issuer).
    pub async fn build(
        self,
        users: Arc<dyn UserRepository>,
    ) -> Result<Portcullis<R>, PortcullisBuilderError> {
        let issuer = self
            .token_issuer
            .require_field("Token issuer")
            .map_err(|e| PortcullisBuilderError::InvalidConfiguration(e.to_string()))?;

        let policy = ThrottlePolicy::new(self.throttle_config)
            .map_err(|e| PortcullisBuilderError::InvalidConfiguration(e.to_string()))?;

        if self.apply_migrations {
            self.storage
                .repository
                .migrate()
                .await
                .map_err(|e| PortcullisBuilderError::Migration(e.to_string()))?;
        }

        let event_bus = EventBus::new();
        for handler in self.event_handlers {
            event_bus.register(handler).await;
        }

        let tracker = AttemptTracker::new(self.storage.repository, policy)
            .with_clock(self.clock)
            .with_event_bus(event_bus);
        let login = LoginService::new(tracker, users, self.verifier, issuer);

        tracing::debug!(
            enabled = login.tracker().is_enabled(),
            "Built portcullis instance"
        );

        Ok(Portcullis::from_login_service(login))
    }
}
