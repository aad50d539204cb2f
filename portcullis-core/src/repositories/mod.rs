//! Repository traits for data access layer
//!
//! - [`AttemptRepository`] stores attempt records and is implemented by the
//!   storage backends ([`InMemoryAttemptStore`] here, SQLite in
//!   `portcullis-storage-sqlite`).
//! - [`UserRepository`] is implemented by the host application, which owns its
//!   user records.

pub mod attempt;
pub mod memory;
pub mod user;

pub use attempt::{AttemptMutation, AttemptRepository, MAX_CAS_RETRIES};
pub use memory::InMemoryAttemptStore;
pub use user::UserRepository;
