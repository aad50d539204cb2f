pub mod utilities;

use thiserror::Error;

use crate::attempt::Namespace;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Failures that are reported to the client.
///
/// Every variant renders a generic message: the cause of an invalid attempt is
/// never distinguished, and a lockout only reveals when to retry.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Too many requests, retry after {remaining_seconds} seconds")]
    LockedOut {
        scope: Namespace,
        remaining_seconds: u64,
    },

    /// The attempt could not be completed; details are only logged.
    #[error("Internal server error")]
    Internal,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Concurrent update conflict: {0}")]
    Conflict(String),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid field: {0}")]
    InvalidField(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("Event bus error: {0}")]
    BusError(String),

    #[error("Event handler error: {0}")]
    HandlerError(String),
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Password verification failed: {0}")]
    PasswordVerification(String),

    #[error("Token signing failed: {0}")]
    TokenSigning(String),
}

impl Error {
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Error::Auth(_))
    }

    pub fn is_locked_out(&self) -> bool {
        matches!(self, Error::Auth(AuthError::LockedOut { .. }))
    }

    pub fn is_validation_error(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    pub fn is_storage_error(&self) -> bool {
        matches!(self, Error::Storage(_))
    }

    pub fn is_crypto_error(&self) -> bool {
        matches!(self, Error::Crypto(_))
    }
}
