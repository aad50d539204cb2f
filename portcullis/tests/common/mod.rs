#![allow(dead_code)]

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use portcullis::{Error, PasswordVerifier, User, UserId, UserRepository};

pub const SECRET: &[u8] = b"integration-test-secret-that-is-long-enough";

/// Users held in a map, keyed by username.
pub struct StaticUsers {
    users: HashMap<String, User>,
}

impl StaticUsers {
    pub fn new(users: impl IntoIterator<Item = User>) -> Arc<Self> {
        Arc::new(Self {
            users: users
                .into_iter()
                .map(|user| (user.username.clone(), user))
                .collect(),
        })
    }

    /// One user per `(username, password)` pair, hashed for [`PlainVerifier`].
    pub fn plain(credentials: &[(&str, &str)]) -> Arc<Self> {
        Self::new(credentials.iter().map(|(username, password)| {
            User::builder()
                .id(UserId::new(&format!("usr_{username}")))
                .username(*username)
                .password_hash(format!("plain:{password}"))
                .build()
                .unwrap()
        }))
    }
}

#[async_trait]
impl UserRepository for StaticUsers {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, Error> {
        Ok(self.users.get(username).cloned())
    }
}

/// Compares against `plain:<password>` so tests don't pay for Argon2.
pub struct PlainVerifier;

#[async_trait]
impl PasswordVerifier for PlainVerifier {
    async fn verify(&self, password: &str, password_hash: &str) -> Result<bool, Error> {
        Ok(password_hash == format!("plain:{password}"))
    }
}
