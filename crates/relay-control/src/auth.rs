//! Credential checks performed on registration and resume

use relay_auth::{JwtError, JwtValidator};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,

    #[error("credential expired")]
    Expired,

    #[error("invalid credential: {0}")]
    Invalid(String),
}

impl From<JwtError> for AuthError {
    fn from(e: JwtError) -> Self {
        match e {
            JwtError::TokenExpired => AuthError::Expired,
            other => AuthError::Invalid(other.to_string()),
        }
    }
}

/// Verifies the credential a backend presents for an id
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, backend_id: &str, credential: &str) -> Result<(), AuthError>;
}

impl<F> CredentialVerifier for F
where
    F: Fn(&str, &str) -> Result<(), AuthError> + Send + Sync,
{
    fn verify(&self, backend_id: &str, credential: &str) -> Result<(), AuthError> {
        self(backend_id, credential)
    }
}

/// HS256 bearer-token verification
pub struct JwtVerifier {
    validator: JwtValidator,
    require_subject_match: bool,
}

impl JwtVerifier {
    pub fn new(validator: JwtValidator) -> Self {
        Self {
            validator,
            require_subject_match: true,
        }
    }

    /// Accept any valid token regardless of its subject
    pub fn allow_any_subject(mut self) -> Self {
        self.require_subject_match = false;
        self
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, backend_id: &str, credential: &str) -> Result<(), AuthError> {
        if credential.is_empty() {
            return Err(AuthError::Missing);
        }
        if self.require_subject_match {
            self.validator.validate_for(credential, backend_id)?;
        } else {
            self.validator.validate(credential)?;
        }
        Ok(())
    }
}
