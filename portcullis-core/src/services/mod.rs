//! Service layer
//!
//! Services hold the business logic and talk to storage only through the
//! repository traits.

pub mod login;
pub mod tracker;

pub use login::{AccessGrant, LoginOutcome, LoginService};
pub use tracker::{AttemptTracker, SAFE_ERROR_MESSAGE};
