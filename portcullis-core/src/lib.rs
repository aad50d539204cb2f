//! Core functionality for the portcullis project
//!
//! This crate holds the brute-force protection engine: attempt records and
//! their storage contract, the read-only [`ThrottlePolicy`], the
//! [`AttemptTracker`] that records failures and successes, and the
//! timing-resistant [`LoginService`].
//!
//! Storage backends implement [`AttemptRepository`]; an in-process
//! [`InMemoryAttemptStore`] is included. The host application supplies its
//! users through [`UserRepository`].
pub mod attempt;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod id;
pub mod policy;
pub mod repositories;
pub mod services;
pub mod token;
pub mod user;

pub use attempt::{AttemptRecord, AttemptUpdate, Namespace, StoredAttempt};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DelaySchedule, DelayStep, MAX_TRACKING_DURATION, ThrottleConfig};
pub use credentials::{Argon2PasswordVerifier, PasswordVerifier, calibrate_dummy_cost};
pub use error::Error;
pub use events::{Event, EventBus, EventHandler, UnlockReason};
pub use policy::{ThrottleDecision, ThrottlePolicy};
pub use repositories::{AttemptRepository, InMemoryAttemptStore, UserRepository};
pub use services::{AccessGrant, AttemptTracker, LoginOutcome, LoginService};
pub use token::{AccessClaims, IssuedToken, JwtConfig, JwtTokenIssuer, TokenIssuer};
pub use user::{Principal, User, UserBuilder, UserId};
