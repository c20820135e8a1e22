//! JWT (JSON Web Token) handling

use chrono::{DateTime, Duration, Local, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Issuer written into tokens minted by this crate
pub const DEFAULT_ISSUER: &str = "tunnel-relay";

/// Audience written into tokens minted by this crate
pub const DEFAULT_AUDIENCE: &str = "relay-agent";

/// Minimum accepted secret length in bytes
pub const MIN_SECRET_LEN: usize = 32;

/// JWT claims for relay authentication
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JwtClaims {
    /// Subject (backend ID)
    pub sub: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// Issuer
    pub iss: String,
    /// Audience
    pub aud: String,
}

impl JwtClaims {
    pub fn new(backend_id: String, issuer: String, audience: String, validity: Duration) -> Self {
        let now = Utc::now();
        let exp = now + validity;

        Self {
            sub: backend_id,
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: issuer,
            aud: audience,
        }
    }

    /// Claims with the default issuer and audience
    pub fn for_backend(backend_id: impl Into<String>, validity: Duration) -> Self {
        Self::new(
            backend_id.into(),
            DEFAULT_ISSUER.to_string(),
            DEFAULT_AUDIENCE.to_string(),
            validity,
        )
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }

    pub fn exp_formatted(&self) -> String {
        let dt = DateTime::<Utc>::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now);
        let local: DateTime<Local> = dt.into();
        local.format("%Y-%m-%d %H:%M:%S %Z").to_string()
    }
}

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token subject '{actual}' does not match '{expected}'")]
    SubjectMismatch { expected: String, actual: String },

    #[error("Secret must be at least {MIN_SECRET_LEN} bytes")]
    WeakSecret,
}

/// The symmetric signing secret. `Debug` never prints the bytes.
#[derive(Clone)]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, JwtError> {
        let secret = secret.into();
        if secret.len() < MIN_SECRET_LEN {
            return Err(JwtError::WeakSecret);
        }
        Ok(Self(secret))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Mint a token for `backend_id` valid for `validity`
    pub fn mint(&self, backend_id: &str, validity: Duration) -> Result<String, JwtError> {
        JwtValidator::encode(&self.0, &JwtClaims::for_backend(backend_id, validity))
    }

    pub fn validator(&self) -> JwtValidator {
        JwtValidator::new(&self.0)
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedSecret(<{} bytes>)", self.0.len())
    }
}

pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Only validate expiration unless issuer/audience are set explicitly
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn with_audience(mut self, audience: String) -> Self {
        self.validation.set_audience(&[audience]);
        self
    }

    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn validate(&self, token: &str) -> Result<JwtClaims, JwtError> {
        let token_data =
            decode::<JwtClaims>(token, &self.decoding_key, &self.validation).map_err(|e| {
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::TokenExpired,
                    jsonwebtoken::errors::ErrorKind::InvalidSignature
                    | jsonwebtoken::errors::ErrorKind::InvalidToken
                    | jsonwebtoken::errors::ErrorKind::Base64(_)
                    | jsonwebtoken::errors::ErrorKind::Json(_)
                    | jsonwebtoken::errors::ErrorKind::Utf8(_) => JwtError::InvalidToken,
                    _ => JwtError::EncodingError(e),
                }
            })?;

        if token_data.claims.is_expired() {
            return Err(JwtError::TokenExpired);
        }

        Ok(token_data.claims)
    }

    /// Validate and require the token to be bound to `backend_id`
    pub fn validate_for(&self, token: &str, backend_id: &str) -> Result<JwtClaims, JwtError> {
        let claims = self.validate(token)?;
        if claims.sub != backend_id {
            return Err(JwtError::SubjectMismatch {
                expected: backend_id.to_string(),
                actual: claims.sub,
            });
        }
        Ok(claims)
    }

    pub fn encode(secret: &[u8], claims: &JwtClaims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::HS256);
        let encoding_key = EncodingKey::from_secret(secret);

        Ok(encode(&header, claims, &encoding_key)?)
    }
}
