//! Credential issuance
//!
//! After a successful verification the login flow asks a [`TokenIssuer`] for a
//! credential bound to the authenticated [`Principal`]. The response is only
//! produced once issuance has completed, successfully or not.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::{
    Error, Principal, UserId,
    error::{CryptoError, ValidationError},
};

/// An opaque credential handed back to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues a credential for an authenticated principal.
#[async_trait]
pub trait TokenIssuer: Send + Sync + 'static {
    async fn issue(&self, principal: &Principal) -> Result<IssuedToken, Error>;
}

/// JWT algorithm and key material
#[derive(Clone)]
pub enum JwtAlgorithm {
    /// RSA with SHA-256, PEM encoded keys
    RS256 {
        private_key: Vec<u8>,
        public_key: Vec<u8>,
    },
    /// HMAC with SHA-256
    HS256 { secret_key: Vec<u8> },
}

impl std::fmt::Debug for JwtAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JwtAlgorithm::RS256 { .. } => f.write_str("RS256"),
            JwtAlgorithm::HS256 { .. } => f.write_str("HS256"),
        }
    }
}

/// Configuration for [`JwtTokenIssuer`]
#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub algorithm: JwtAlgorithm,
    /// Issuer claim
    pub issuer: Option<String>,
    /// Lifetime of issued tokens
    pub expires_in: Duration,
}

impl JwtConfig {
    /// Create a new JWT configuration with RS256 algorithm
    pub fn new_rs256(private_key: Vec<u8>, public_key: Vec<u8>) -> Self {
        Self {
            algorithm: JwtAlgorithm::RS256 {
                private_key,
                public_key,
            },
            issuer: None,
            expires_in: Duration::hours(24),
        }
    }

    /// Create a new JWT configuration with HS256 algorithm
    pub fn new_hs256(secret_key: Vec<u8>) -> Self {
        Self {
            algorithm: JwtAlgorithm::HS256 { secret_key },
            issuer: None,
            expires_in: Duration::hours(24),
        }
    }

    /// Create a new JWT configuration from RSA key files (PEM format)
    pub fn from_rs256_pem_files(
        private_key_path: impl AsRef<Path>,
        public_key_path: impl AsRef<Path>,
    ) -> Result<Self, Error> {
        let private_key = std::fs::read(private_key_path).map_err(|e| {
            ValidationError::InvalidField(format!("Failed to read private key file: {e}"))
        })?;
        let public_key = std::fs::read(public_key_path).map_err(|e| {
            ValidationError::InvalidField(format!("Failed to read public key file: {e}"))
        })?;

        Ok(Self::new_rs256(private_key, public_key))
    }

    /// Set the issuer claim
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Set the lifetime of issued tokens
    pub fn with_expires_in(mut self, expires_in: Duration) -> Self {
        self.expires_in = expires_in;
        self
    }

    fn jwt_algorithm(&self) -> Algorithm {
        match &self.algorithm {
            JwtAlgorithm::RS256 { .. } => Algorithm::RS256,
            JwtAlgorithm::HS256 { .. } => Algorithm::HS256,
        }
    }

    fn encoding_key(&self) -> Result<EncodingKey, Error> {
        match &self.algorithm {
            JwtAlgorithm::RS256 { private_key, .. } => EncodingKey::from_rsa_pem(private_key)
                .map_err(|e| {
                    ValidationError::InvalidField(format!("Invalid RSA private key: {e}")).into()
                }),
            JwtAlgorithm::HS256 { secret_key } => Ok(EncodingKey::from_secret(secret_key)),
        }
    }

    fn decoding_key(&self) -> Result<DecodingKey, Error> {
        match &self.algorithm {
            JwtAlgorithm::RS256 { public_key, .. } => DecodingKey::from_rsa_pem(public_key)
                .map_err(|e| {
                    ValidationError::InvalidField(format!("Invalid RSA public key: {e}")).into()
                }),
            JwtAlgorithm::HS256 { secret_key } => Ok(DecodingKey::from_secret(secret_key)),
        }
    }
}

/// Claims carried by an access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject - user ID
    pub sub: String,
    pub username: String,
    pub is_admin: bool,
    /// Issued at in seconds (as UTC timestamp)
    pub iat: i64,
    /// Expiration time in seconds (as UTC timestamp)
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

impl AccessClaims {
    pub fn user_id(&self) -> UserId {
        UserId::new(&self.sub)
    }
}

/// Signs stateless access tokens.
pub struct JwtTokenIssuer {
    config: JwtConfig,
}

impl JwtTokenIssuer {
    pub fn new(config: JwtConfig) -> Self {
        Self { config }
    }

    /// Verify a token issued by this issuer and return its claims.
    pub fn verify(&self, token: &str) -> Result<AccessClaims, Error> {
        let mut validation = Validation::new(self.config.jwt_algorithm());
        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(&[issuer]);
        }

        decode::<AccessClaims>(token, &self.config.decoding_key()?, &validation)
            .map(|data| data.claims)
            .map_err(|e| ValidationError::InvalidField(format!("Invalid token: {e}")).into())
    }
}

#[async_trait]
impl TokenIssuer for JwtTokenIssuer {
    async fn issue(&self, principal: &Principal) -> Result<IssuedToken, Error> {
        let now = Utc::now();
        let expires_at = now.checked_add_signed(self.config.expires_in).ok_or_else(|| {
            ValidationError::InvalidConfiguration("expires_in is out of range".to_string())
        })?;
        let claims = AccessClaims {
            sub: principal.id.to_string(),
            username: principal.username.clone(),
            is_admin: principal.is_admin,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            iss: self.config.issuer.clone(),
        };

        let header = Header::new(self.config.jwt_algorithm());
        let token = encode(&header, &claims, &self.config.encoding_key()?)
            .map_err(|e| CryptoError::TokenSigning(e.to_string()))?;

        Ok(IssuedToken { token, expires_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_HS256_SECRET: &[u8] = b"test_secret_key_for_hs256_jwt_tokens_not_for_production_use";

    fn principal() -> Principal {
        Principal {
            id: UserId::new("usr_test"),
            username: "alice".to_string(),
            is_admin: true,
        }
    }

    #[tokio::test]
    async fn test_issue_and_verify() {
        let issuer = JwtTokenIssuer::new(
            JwtConfig::new_hs256(TEST_HS256_SECRET.to_vec()).with_issuer("portcullis-test"),
        );

        let issued = issuer.issue(&principal()).await.unwrap();
        let claims = issuer.verify(&issued.token).unwrap();

        assert_eq!(claims.user_id(), UserId::new("usr_test"));
        assert_eq!(claims.username, "alice");
        assert!(claims.is_admin);
        assert_eq!(claims.iss.as_deref(), Some("portcullis-test"));
        assert_eq!(claims.exp, issued.expires_at.timestamp());
        assert_eq!(claims.exp - claims.iat, Duration::hours(24).num_seconds());
    }

    #[tokio::test]
    async fn test_verify_rejects_foreign_secret() {
        let issuer = JwtTokenIssuer::new(JwtConfig::new_hs256(TEST_HS256_SECRET.to_vec()));
        let other = JwtTokenIssuer::new(JwtConfig::new_hs256(b"another_secret".to_vec()));

        let issued = issuer.issue(&principal()).await.unwrap();
        assert!(other.verify(&issued.token).is_err());
    }

    #[tokio::test]
    async fn test_invalid_rsa_key_fails_to_issue() {
        let issuer = JwtTokenIssuer::new(JwtConfig::new_rs256(
            b"not a pem".to_vec(),
            b"not a pem".to_vec(),
        ));
        let result = issuer.issue(&principal()).await;
        assert!(result.unwrap_err().is_validation_error());
    }
}
