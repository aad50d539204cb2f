use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{UserId, attempt::Namespace, error::EventError};

/// Reason why an identity was unlocked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnlockReason {
    /// Administrator manually unlocked the identity
    AdminAction,
    /// The host application reset the account's credentials
    PasswordReset,
}

/// Security events emitted by the login flow and the attempt tracker.
///
/// Events are notifications only. Handlers observe what happened, they cannot
/// change the outcome of the attempt that produced the event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Emitted after credentials were verified and a token was issued.
    LoginSucceeded {
        user_id: UserId,
        username: String,
        client_ip: String,
        timestamp: DateTime<Utc>,
    },

    /// Emitted when a login attempt fails verification.
    ///
    /// Does not say whether the username exists.
    LoginFailed {
        username: String,
        client_ip: String,
        /// Failures now counted against the username
        username_failures: u32,
        /// Failures now counted against the client address
        ip_failures: u32,
        timestamp: DateTime<Utc>,
    },

    /// Emitted when a recorded failure moves an identity into the locked state.
    ///
    /// This is a security-critical event that should trigger alerts.
    IdentityLocked {
        namespace: Namespace,
        identity: String,
        failure_count: u32,
        locked_until: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// Emitted when a lock in force is lifted before it expires.
    IdentityUnlocked {
        namespace: Namespace,
        identity: String,
        reason: UnlockReason,
        timestamp: DateTime<Utc>,
    },
}

/// A trait for handling events emitted by the event bus
///
/// # Examples
///
/// ```
/// # use portcullis_core::events::{Event, EventHandler};
/// # use portcullis_core::error::EventError;
/// # use async_trait::async_trait;
/// struct AuditLog;
///
/// #[async_trait]
/// impl EventHandler for AuditLog {
///     async fn handle_event(&self, event: &Event) -> Result<(), EventError> {
///         println!("{event:?}");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle_event(&self, event: &Event) -> Result<(), EventError>;
}

/// Event bus that fans events out to registered handlers, in registration order.
#[derive(Clone)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register an event handler with the event bus
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// Emit an event to all registered handlers, stopping at the first error.
    pub async fn emit(&self, event: &Event) -> Result<(), EventError> {
        for handler in self.handlers.read().await.iter() {
            handler.handle_event(event).await?;
        }

        Ok(())
    }

    /// Deliver an event to every handler, logging failures instead of returning them.
    pub async fn publish(&self, event: &Event) {
        for handler in self.handlers.read().await.iter() {
            if let Err(e) = handler.handle_event(event).await {
                tracing::warn!(error = %e, event = ?event, "Event handler failed");
            }
        }
    }
}
