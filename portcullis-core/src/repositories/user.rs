use crate::{Error, User};
use async_trait::async_trait;

/// Lookup of user records owned by the host application.
///
/// Implementations should return `Ok(None)` for unknown usernames and reserve
/// errors for genuine storage failures.
#[async_trait]
pub trait UserRepository: Send + Sync + 'static {
    /// Find a user by username
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, Error>;
}
