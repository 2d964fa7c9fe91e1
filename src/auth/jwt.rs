//! Token Service — signs and verifies session tokens.
//!
//! Tokens are HS256 JWTs carrying `{id, email, role, iat, exp, iss, aud}`.
//! Nothing is stored server-side: a token is valid until `exp` as long as the
//! signature, issuer and audience check out.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::TokenConfig;
use crate::models::user::{Principal, Role};

pub const ISSUER: &str = "node-cil-backend";
pub const AUDIENCE: &str = "node-cil-client";

const ALGORITHM: Algorithm = Algorithm::HS256;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,

    #[error("token invalid: {0}")]
    Invalid(String),

    #[error("token signing failed: {0}")]
    Signing(String),
}

/// The caller-supplied part of a token payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub id: String,
    pub email: String,
    pub role: Role,
}

impl From<&Principal> for TokenClaims {
    fn from(p: &Principal) -> Self {
        Self {
            id: p.id.clone(),
            email: p.email.clone(),
            role: p.role,
        }
    }
}

/// Full decoded payload as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub id: String,
    pub email: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

impl Claims {
    pub fn subject(&self) -> TokenClaims {
        TokenClaims {
            id: self.id.clone(),
            email: self.email.clone(),
            role: self.role,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
}

pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn new(cfg: &TokenConfig) -> Self {
        let mut validation = Validation::new(ALGORITHM);
        validation.leeway = 0;
        validation.set_issuer(&[ISSUER]);
        validation.set_audience(&[AUDIENCE]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            validation,
            access_ttl: Duration::seconds(cfg.access_ttl_secs as i64),
            refresh_ttl: Duration::seconds(cfg.refresh_ttl_secs as i64),
        }
    }

    pub fn access_ttl_secs(&self) -> i64 {
        self.access_ttl.num_seconds()
    }

    pub fn issue_access_token(&self, claims: &TokenClaims) -> Result<String, TokenError> {
        self.sign_at(claims, self.access_ttl, Utc::now())
    }

    pub fn issue_refresh_token(&self, claims: &TokenClaims) -> Result<String, TokenError> {
        self.sign_at(claims, self.refresh_ttl, Utc::now())
    }

    pub fn issue_token_pair(&self, principal: &Principal) -> Result<TokenPair, TokenError> {
        let claims = TokenClaims::from(principal);
        Ok(TokenPair {
            access_token: self.issue_access_token(&claims)?,
            refresh_token: self.issue_refresh_token(&claims)?,
            expires_in: self.access_ttl_secs(),
        })
    }

    /// Verify signature, issuer, audience and expiry, returning the payload.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(e.to_string()),
            })
    }

    fn sign_at(
        &self,
        claims: &TokenClaims,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let payload = Claims {
            id: claims.id.clone(),
            email: claims.email.clone(),
            role: claims.role,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            iss: ISSUER.to_string(),
            aud: AUDIENCE.to_string(),
        };
        encode(&Header::new(ALGORITHM), &payload, &self.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header value.
/// Anything else, including a missing header, yields `None`.
pub fn extract_from_header(header: Option<&str>) -> Option<&str> {
    let value = header?;
    let mut parts = value.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("Bearer"), Some(token), None) if !token.is_empty() => Some(token),
        _ => None,
    }
}
