//! Users as seen by the login flow
//!
//! User persistence belongs to the host application. The login flow only needs
//! enough of a user record to verify a password and to name the principal a
//! credential is issued for:
//!
//! | Field           | Type     | Description                                   |
//! | --------------- | -------- | --------------------------------------------- |
//! | `id`            | `UserId` | The unique identifier for the user.           |
//! | `username`      | `String` | The name the user logs in with.               |
//! | `password_hash` | `String` | PHC-formatted password hash.                  |
//! | `is_admin`      | `bool`   | Whether the user holds administrative rights. |
use serde::{Deserialize, Serialize};

use crate::{
    Error,
    error::utilities::RequiredFieldExt,
    id::{generate_prefixed_id, validate_prefixed_id},
};

/// A unique, stable identifier for a specific user
/// This value should be treated as opaque, and should not be used as a UUID even if it may look like one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: &str) -> Self {
        UserId(id.to_string())
    }

    pub fn new_random() -> Self {
        UserId(generate_prefixed_id("usr"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validate that this ID has the correct format for a user ID
    pub fn is_valid(&self) -> bool {
        validate_prefixed_id(&self.0, "usr")
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new_random()
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user record as returned by [`UserRepository`](crate::repositories::UserRepository).
#[derive(Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub password_hash: String,
    pub is_admin: bool,
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("password_hash", &"<redacted>")
            .field("is_admin", &self.is_admin)
            .finish()
    }
}

impl User {
    pub fn builder() -> UserBuilder {
        UserBuilder::default()
    }

    /// The identity a credential is issued for. Never carries the password hash.
    pub fn principal(&self) -> Principal {
        Principal {
            id: self.id.clone(),
            username: self.username.clone(),
            is_admin: self.is_admin,
        }
    }
}

#[derive(Default)]
pub struct UserBuilder {
    id: Option<UserId>,
    username: Option<String>,
    password_hash: Option<String>,
    is_admin: bool,
}

impl UserBuilder {
    pub fn id(mut self, id: UserId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password_hash(mut self, password_hash: impl Into<String>) -> Self {
        self.password_hash = Some(password_hash.into());
        self
    }

    pub fn is_admin(mut self, is_admin: bool) -> Self {
        self.is_admin = is_admin;
        self
    }

    pub fn build(self) -> Result<User, Error> {
        Ok(User {
            id: self.id.unwrap_or_default(),
            username: self.username.require_field("Username")?,
            password_hash: self.password_hash.require_field("Password hash")?,
            is_admin: self.is_admin,
        })
    }
}

/// The authenticated party a credential is issued for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: UserId,
    pub username: String,
    pub is_admin: bool,
}
