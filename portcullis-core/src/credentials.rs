//! Password verification and dummy-cost calibration
//!
//! The login flow hides whether a username exists by making the "unknown user"
//! branch cost about as much wall-clock time as a real verification. That only
//! holds while the configured dummy cost tracks the real hashing cost, so
//! [`calibrate_dummy_cost`] measures it against the verifier actually in use.

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    Error,
    error::{CryptoError, ValidationError},
};

/// Checks a plaintext password against a stored hash.
///
/// Implementations return `Ok(false)` for a mismatch and reserve errors for
/// failures of the primitive itself (malformed hash, worker failure).
#[async_trait]
pub trait PasswordVerifier: Send + Sync + 'static {
    async fn verify(&self, password: &str, password_hash: &str) -> Result<bool, Error>;
}

/// Argon2 verification via `password-auth`, run on the blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct Argon2PasswordVerifier;

impl Argon2PasswordVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Hash a password with the same parameters the verifier expects.
    pub fn hash_password(password: &str) -> String {
        password_auth::generate_hash(password)
    }
}

#[async_trait]
impl PasswordVerifier for Argon2PasswordVerifier {
    async fn verify(&self, password: &str, password_hash: &str) -> Result<bool, Error> {
        let password = password.to_string();
        let password_hash = password_hash.to_string();

        let outcome = tokio::task::spawn_blocking(move || {
            password_auth::verify_password(password.as_bytes(), &password_hash)
        })
        .await
        .map_err(|e| CryptoError::PasswordVerification(format!("verifier task failed: {e}")))?;

        match outcome {
            Ok(()) => Ok(true),
            Err(password_auth::VerifyError::PasswordInvalid) => Ok(false),
            Err(e) => Err(CryptoError::PasswordVerification(e.to_string()).into()),
        }
    }
}

/// Median time `verifier` takes to reject a wrong password for `reference_hash`.
///
/// Feed the result into `ThrottleConfig::dummy_verify_cost` whenever hashing
/// parameters change.
pub async fn calibrate_dummy_cost<V: PasswordVerifier + ?Sized>(
    verifier: &V,
    reference_hash: &str,
    samples: usize,
) -> Result<Duration, Error> {
    if samples == 0 {
        return Err(ValidationError::InvalidField(
            "calibration needs at least one sample".to_string(),
        )
        .into());
    }

    let mut timings = Vec::with_capacity(samples);
    for _ in 0..samples {
        let started = tokio::time::Instant::now();
        verifier
            .verify("portcullis-calibration-sample", reference_hash)
            .await?;
        timings.push(started.elapsed());
    }
    timings.sort();

    let median = timings[timings.len() / 2];
    tracing::info!(
        samples,
        median_ms = median.as_millis() as u64,
        "Calibrated dummy verification cost"
    );
    Ok(median)
}
