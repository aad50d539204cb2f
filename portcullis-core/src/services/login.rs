//! Timing-resistant password login.
//!
//! One call to [`LoginService::attempt_login_at`] runs one attempt through the
//! following steps:
//!
//! 1. Reject if the client address is locked, without looking at the username.
//! 2. Reject if the username is locked.
//! 3. Sleep for the username's progressive delay, if any.
//! 4. Look the user up. A known user has their password verified; an unknown
//!    user costs a fixed dummy delay and counts as a failed verification.
//! 5. On failure, record it against both the address and the username and
//!    answer with the generic message.
//! 6. On success, clear both records and issue a token.
//!
//! Steps 4 to 6 run in their own task, so an attempt whose caller goes away
//! after the delay is still recorded. Collaborator errors end the attempt in
//! [`LoginOutcome::Error`] and are only visible in the logs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    Error, Principal,
    attempt::Namespace,
    credentials::PasswordVerifier,
    error::AuthError,
    events::Event,
    repositories::{AttemptRepository, UserRepository},
    services::tracker::{AttemptTracker, SAFE_ERROR_MESSAGE},
    token::{IssuedToken, TokenIssuer},
};

/// The terminal state of a login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Accepted {
        principal: Principal,
        token: IssuedToken,
    },
    /// The client address or the account is locked
    RejectedLocked {
        scope: Namespace,
        remaining_seconds: u64,
    },
    /// Verification failed; `message` never says why
    RejectedInvalid { message: String },
    /// A collaborator failed; details were logged server side
    Error,
}

impl LoginOutcome {
    fn invalid() -> Self {
        LoginOutcome::RejectedInvalid {
            message: SAFE_ERROR_MESSAGE.to_string(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, LoginOutcome::Accepted { .. })
    }

    /// The text a client may see. `None` for an accepted attempt.
    pub fn message(&self) -> Option<String> {
        match self {
            LoginOutcome::Accepted { .. } => None,
            LoginOutcome::RejectedLocked {
                scope,
                remaining_seconds,
            } => Some(
                AuthError::LockedOut {
                    scope: *scope,
                    remaining_seconds: *remaining_seconds,
                }
                .to_string(),
            ),
            LoginOutcome::RejectedInvalid { message } => Some(message.clone()),
            LoginOutcome::Error => Some(AuthError::Internal.to_string()),
        }
    }

    pub fn into_result(self) -> Result<AccessGrant, Error> {
        match self {
            LoginOutcome::Accepted { principal, token } => Ok(AccessGrant { principal, token }),
            LoginOutcome::RejectedLocked {
                scope,
                remaining_seconds,
            } => Err(AuthError::LockedOut {
                scope,
                remaining_seconds,
            }
            .into()),
            LoginOutcome::RejectedInvalid { .. } => Err(AuthError::InvalidCredentials.into()),
            LoginOutcome::Error => Err(AuthError::Internal.into()),
        }
    }
}

/// What an accepted login hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub principal: Principal,
    pub token: IssuedToken,
}

/// Runs login attempts against the attempt tracker and the host's collaborators.
pub struct LoginService<R: AttemptRepository> {
    tracker: AttemptTracker<R>,
    users: Arc<dyn UserRepository>,
    verifier: Arc<dyn PasswordVerifier>,
    issuer: Arc<dyn TokenIssuer>,
}

impl<R: AttemptRepository> Clone for LoginService<R> {
    fn clone(&self) -> Self {
        Self {
            tracker: self.tracker.clone(),
            users: Arc::clone(&self.users),
            verifier: Arc::clone(&self.verifier),
            issuer: Arc::clone(&self.issuer),
        }
    }
}

impl<R: AttemptRepository> LoginService<R> {
    pub fn new(
        tracker: AttemptTracker<R>,
        users: Arc<dyn UserRepository>,
        verifier: Arc<dyn PasswordVerifier>,
        issuer: Arc<dyn TokenIssuer>,
    ) -> Self {
        Self {
            tracker,
            users,
            verifier,
            issuer,
        }
    }

    pub fn tracker(&self) -> &AttemptTracker<R> {
        &self.tracker
    }

    /// Attempt a login at the tracker's current time.
    pub async fn attempt_login(
        &self,
        username: &str,
        password: &str,
        client_ip: &str,
    ) -> LoginOutcome {
        self.attempt_login_at(username, password, client_ip, self.tracker.now())
            .await
    }

    /// Attempt a login, evaluating and recording everything at `now`.
    pub async fn attempt_login_at(
        &self,
        username: &str,
        password: &str,
        client_ip: &str,
        now: DateTime<Utc>,
    ) -> LoginOutcome {
        let ip_decision = match self
            .tracker
            .check_identity(Namespace::Ip, client_ip, now)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(error = %e, client_ip, "Failed to check client address");
                return LoginOutcome::Error;
            }
        };
        if ip_decision.locked {
            tracing::warn!(
                client_ip,
                remaining_seconds = ip_decision.remaining_lock_seconds,
                "Rejected login from locked client address"
            );
            return LoginOutcome::RejectedLocked {
                scope: Namespace::Ip,
                remaining_seconds: ip_decision.remaining_lock_seconds,
            };
        }

        let user_decision = match self
            .tracker
            .check_identity(Namespace::Username, username, now)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(error = %e, username, "Failed to check username");
                return LoginOutcome::Error;
            }
        };
        if user_decision.locked {
            tracing::warn!(
                username,
                client_ip,
                remaining_seconds = user_decision.remaining_lock_seconds,
                "Rejected login for locked account"
            );
            return LoginOutcome::RejectedLocked {
                scope: Namespace::Username,
                remaining_seconds: user_decision.remaining_lock_seconds,
            };
        }

        if !user_decision.delay.is_zero() {
            tracing::debug!(
                username,
                delay_ms = user_decision.delay.as_millis() as u64,
                "Applying progressive delay"
            );
            tokio::time::sleep(user_decision.delay).await;
        }

        let service = self.clone();
        let username = username.to_string();
        let password = password.to_string();
        let client_ip = client_ip.to_string();
        let attempt = tokio::spawn(async move {
            service
                .verify_and_record(&username, &password, &client_ip, now)
                .await
        });

        match attempt.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "Login task failed");
                LoginOutcome::Error
            }
        }
    }

    async fn verify_and_record(
        &self,
        username: &str,
        password: &str,
        client_ip: &str,
        now: DateTime<Utc>,
    ) -> LoginOutcome {
        let user = match self.users.find_by_username(username).await {
            Ok(user) => user,
            Err(e) => {
                tracing::error!(error = %e, username, "Failed to look up user");
                return LoginOutcome::Error;
            }
        };

        let verified = match &user {
            Some(user) => self.verifier.verify(password, &user.password_hash).await,
            None => {
                tokio::time::sleep(self.tracker.config().dummy_verify_cost).await;
                Ok(false)
            }
        };

        match (verified, user) {
            (Ok(true), Some(user)) => {
                self.accept(user.principal(), username, client_ip, now)
                    .await
            }
            (Ok(_), _) => match self.record_failures(username, client_ip, now).await {
                Ok(()) => LoginOutcome::invalid(),
                Err(e) => {
                    tracing::error!(error = %e, username, client_ip, "Failed to record failed login");
                    LoginOutcome::Error
                }
            },
            (Err(e), _) => {
                tracing::error!(error = %e, username, "Password verification failed");
                if let Err(e) = self.record_failures(username, client_ip, now).await {
                    tracing::error!(error = %e, username, client_ip, "Failed to record failed login");
                }
                LoginOutcome::Error
            }
        }
    }

    async fn record_failures(
        &self,
        username: &str,
        client_ip: &str,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let ip = self
            .tracker
            .record_failure(Namespace::Ip, client_ip, now)
            .await?;
        let user = self
            .tracker
            .record_failure(Namespace::Username, username, now)
            .await?;

        tracing::warn!(
            username,
            client_ip,
            username_failures = user.failure_count,
            ip_failures = ip.failure_count,
            "Login failed"
        );
        self.tracker
            .event_bus()
            .publish(&Event::LoginFailed {
                username: username.to_string(),
                client_ip: client_ip.to_string(),
                username_failures: user.failure_count,
                ip_failures: ip.failure_count,
                timestamp: now,
            })
            .await;

        Ok(())
    }

    /// Clear the identities that were charged, keyed by the username as supplied
    /// rather than as the user store spells it.
    async fn accept(
        &self,
        principal: Principal,
        username: &str,
        client_ip: &str,
        now: DateTime<Utc>,
    ) -> LoginOutcome {
        let reset = async {
            self.tracker
                .record_success(Namespace::Ip, client_ip)
                .await?;
            self.tracker
                .record_success(Namespace::Username, username)
                .await
        };
        if let Err(e) = reset.await {
            tracing::error!(error = %e, username, "Failed to clear attempt records");
            return LoginOutcome::Error;
        }

        let token = match self.issuer.issue(&principal).await {
            Ok(token) => token,
            Err(e) => {
                tracing::error!(error = %e, user_id = %principal.id, "Failed to issue token");
                return LoginOutcome::Error;
            }
        };

        tracing::info!(user_id = %principal.id, client_ip, "Login succeeded");
        self.tracker
            .event_bus()
            .publish(&Event::LoginSucceeded {
                user_id: principal.id.clone(),
                username: principal.username.clone(),
                client_ip: client_ip.to_string(),
                timestamp: now,
            })
            .await;

        LoginOutcome::Accepted { principal, token }
    }
}
