//! Connection-time authentication.
//!
//! The login flows live elsewhere; by the time a browser opens the chat
//! socket it carries an `auth` cookie of the form `<payload>.<signature>`,
//! where the payload is base64 JSON claims and the signature is hex
//! HMAC-SHA256 over the payload.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

pub const AUTH_COOKIE: &str = "auth";

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("auth cookie not found")]
    MissingCookie,
    #[error("invalid auth cookie format")]
    Malformed,
    #[error("invalid auth cookie signature")]
    BadSignature,
    #[error("invalid auth cookie payload")]
    BadPayload,
    #[error("auth cookie has no display name")]
    MissingName,
    #[error("auth secret is not a usable HMAC key")]
    InvalidKey,
    #[error("auth cookie could not be encoded: {0}")]
    Encode(String),
}

/// Who a participant is. Fixed for the lifetime of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub avatar_url: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, avatar_url: impl Into<String>) -> Self {
        Identity {
            name: name.into(),
            avatar_url: avatar_url.into(),
        }
    }
}

/// The part of the cookie payload chat cares about. Other keys the login
/// flow writes (user id, email) are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolves the identity behind an upgrade request, given the raw
    /// value of its `auth` cookie if one was sent.
    async fn authenticate(&self, cookie: Option<&str>) -> Result<Identity, AuthError>;
}

pub struct CookieAuthenticator {
    secret: Vec<u8>,
}

impl CookieAuthenticator {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        CookieAuthenticator {
            secret: secret.into(),
        }
    }

    /// A key that only lives as long as the process; every cookie issued
    /// before a restart becomes invalid.
    pub fn ephemeral() -> Self {
        let mut secret = vec![0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self::new(secret)
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::InvalidKey)
    }

    /// Produces a cookie value that `verify` accepts.
    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        let json = serde_json::to_vec(claims).map_err(|e| AuthError::Encode(e.to_string()))?;
        let payload = BASE64.encode(json);
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        Ok(format!("{payload}.{signature}"))
    }

    pub fn verify(&self, raw: &str) -> Result<Claims, AuthError> {
        let (payload, signature) = raw.rsplit_once('.').ok_or(AuthError::Malformed)?;
        if payload.is_empty() || signature.is_empty() {
            return Err(AuthError::Malformed);
        }

        let signature = hex::decode(signature).map_err(|_| AuthError::BadSignature)?;
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let json = BASE64.decode(payload).map_err(|_| AuthError::BadPayload)?;
        serde_json::from_slice(&json).map_err(|_| AuthError::BadPayload)
    }
}

#[async_trait]
impl Authenticator for CookieAuthenticator {
    async fn authenticate(&self, cookie: Option<&str>) -> Result<Identity, AuthError> {
        let raw = cookie
            .filter(|value| !value.is_empty())
            .ok_or(AuthError::MissingCookie)?;
        let claims = self.verify(raw)?;
        if claims.name.is_empty() {
            return Err(AuthError::MissingName);
        }
        Ok(Identity::new(
            claims.name,
            claims.avatar_url.unwrap_or_default(),
        ))
    }
}
