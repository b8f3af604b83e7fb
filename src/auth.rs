//! Login and bearer tokens.
//!
//! Users are listed in `[[auth.users]]` with a SHA-256 password digest. A
//! successful login returns a stateless token:
//!
//! ```text
//! base64url(username ":" expiry_unix) "." hex(HMAC-SHA256(secret, payload))
//! ```
//!
//! Tokens survive restarts as long as the secret does. Without the secret
//! environment variable a random per-process secret is used and all tokens
//! become invalid on restart.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

use crate::config::AuthConfig;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("malformed token")]
    Malformed,
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("unknown user")]
    UnknownUser,
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct Authenticator {
    secret: Vec<u8>,
    ttl_secs: i64,
    /// username → HMAC of the password's SHA-256 digest
    users: HashMap<String, Vec<u8>>,
}

/// Hex SHA-256 of a password, the format stored in `password_sha256`.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

impl Authenticator {
    pub fn from_config(config: &AuthConfig) -> anyhow::Result<Self> {
        let secret = match std::env::var(&config.secret_env) {
            Ok(s) if !s.is_empty() => s.into_bytes(),
            _ => {
                tracing::warn!(
                    env = %config.secret_env,
                    "auth secret not set; using a random secret, tokens will not survive a restart"
                );
                format!("{}{}", uuid::Uuid::new_v4(), uuid::Uuid::new_v4()).into_bytes()
            }
        };

        let mut auth = Self {
            secret,
            ttl_secs: config.token_ttl_secs,
            users: HashMap::new(),
        };
        for user in &config.users {
            let digest = hex::decode(user.password_sha256.to_ascii_lowercase())?;
            let tag = auth.sign(&digest);
            auth.users.insert(user.username.clone(), tag);
        }
        Ok(auth)
    }

    /// Checks credentials and issues a token valid from `now`.
    pub fn login(&self, username: &str, password: &str, now: DateTime<Utc>) -> Result<IssuedToken, AuthError> {
        let expected = self.users.get(username).ok_or(AuthError::InvalidCredentials)?;
        let mut mac = self.mac();
        mac.update(&Sha256::digest(password.as_bytes()));
        mac.verify_slice(expected)
            .map_err(|_| AuthError::InvalidCredentials)?;

        let expires_at = now + chrono::Duration::seconds(self.ttl_secs);
        let payload = format!("{}:{}", username, expires_at.timestamp());
        let encoded = URL_SAFE_NO_PAD.encode(payload.as_bytes());
        let signature = hex::encode(self.sign(encoded.as_bytes()));
        Ok(IssuedToken {
            token: format!("{}.{}", encoded, signature),
            expires_at,
        })
    }

    /// Verifies a token and returns the username it was issued to.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<String, AuthError> {
        let (encoded, signature) = token.split_once('.').ok_or(AuthError::Malformed)?;
        let signature = hex::decode(signature).map_err(|_| AuthError::Malformed)?;

        let mut mac = self.mac();
        mac.update(encoded.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let payload = URL_SAFE_NO_PAD
            .decode(encoded)
            .ok()
            .and_then(|b| String::from_utf8(b).ok())
            .ok_or(AuthError::Malformed)?;
        let (username, expiry) = payload.rsplit_once(':').ok_or(AuthError::Malformed)?;
        let expiry: i64 = expiry.parse().map_err(|_| AuthError::Malformed)?;

        if now.timestamp() >= expiry {
            return Err(AuthError::Expired);
        }
        if !self.users.contains_key(username) {
            return Err(AuthError::UnknownUser);
        }
        Ok(username.to_string())
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size")
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = self.mac();
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}
