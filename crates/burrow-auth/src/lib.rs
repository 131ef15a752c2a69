//! Service token minting and verification
//!
//! Tokens are HS256 JWTs signed by one key of a rotating keyset. The `kid`
//! header selects the key; verification fails for unknown or retired kids,
//! so revoking a key invalidates every token it signed.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default token lifetime.
const TOKEN_LIFETIME_HOURS: i64 = 24;

/// Claims carried by a service token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceClaims {
    /// Endpoint type
    pub t: String,
    /// Endpoint name
    pub n: String,
    /// Agent name
    pub a: String,
    pub iat: i64,
    pub exp: i64,
}

/// The identity a verified token maps to; equivalent to a service
/// certificate for the same tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub endpoint_type: String,
    pub endpoint_name: String,
    pub agent: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Token has no kid header")]
    MissingKid,

    #[error("Unknown signing key '{0}'")]
    UnknownKey(String),

    #[error("Token expired")]
    Expired,

    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::InvalidToken(e.to_string()),
        }
    }
}

/// A rotating set of HMAC signing keys keyed by kid.
#[derive(Default)]
pub struct Keyset {
    keys: HashMap<String, Vec<u8>>,
    current: Option<String>,
}

impl Keyset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a keyset from configured secrets, marking one as current.
    pub fn from_keys(
        keys: impl IntoIterator<Item = (String, Vec<u8>)>,
        current: &str,
    ) -> Result<Self, AuthError> {
        let keys: HashMap<String, Vec<u8>> = keys.into_iter().collect();
        if !keys.contains_key(current) {
            return Err(AuthError::UnknownKey(current.to_string()));
        }
        Ok(Self {
            keys,
            current: Some(current.to_string()),
        })
    }

    /// Add a key. The first key added becomes current.
    pub fn insert(&mut self, kid: impl Into<String>, secret: impl Into<Vec<u8>>) {
        let kid = kid.into();
        if self.current.is_none() {
            self.current = Some(kid.clone());
        }
        self.keys.insert(kid, secret.into());
    }

    /// Retire a key; tokens signed with it stop verifying.
    pub fn remove(&mut self, kid: &str) {
        self.keys.remove(kid);
        if self.current.as_deref() == Some(kid) {
            self.current = None;
        }
    }

    pub fn current_kid(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Mint a token with the given key.
    pub fn mint(
        &self,
        kid: &str,
        endpoint_type: &str,
        endpoint_name: &str,
        agent: &str,
    ) -> Result<String, AuthError> {
        let secret = self
            .keys
            .get(kid)
            .ok_or_else(|| AuthError::UnknownKey(kid.to_string()))?;

        let now = Utc::now();
        let claims = ServiceClaims {
            t: endpoint_type.to_string(),
            n: endpoint_name.to_string(),
            a: agent.to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::hours(TOKEN_LIFETIME_HOURS)).timestamp(),
        };

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(kid.to_string());

        Ok(encode(&header, &claims, &EncodingKey::from_secret(secret))?)
    }

    /// Mint a token with the current key.
    pub fn mint_current(
        &self,
        endpoint_type: &str,
        endpoint_name: &str,
        agent: &str,
    ) -> Result<String, AuthError> {
        let kid = self.current.as_deref().ok_or(AuthError::MissingKid)?;
        self.mint(kid, endpoint_type, endpoint_name, agent)
    }

    /// Verify a token and return the identity it binds.
    pub fn verify(&self, token: &str) -> Result<ServiceIdentity, AuthError> {
        let header = decode_header(token)?;
        let kid = header.kid.ok_or(AuthError::MissingKid)?;
        let secret = self
            .keys
            .get(&kid)
            .ok_or_else(|| AuthError::UnknownKey(kid.clone()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;

        let data = decode::<ServiceClaims>(token, &DecodingKey::from_secret(secret), &validation)?;

        Ok(ServiceIdentity {
            endpoint_type: data.claims.t,
            endpoint_name: data.claims.n,
            agent: data.claims.a,
        })
    }
}
