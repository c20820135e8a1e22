//! Bearer-token authentication for the relay
//!
//! A shared secret, provisioned out of band, signs short-lived HS256 tokens.
//! Agents (or an operator) mint tokens locally with no round trip; the relay
//! verifies signature and expiry on every registration. Only tokens cross
//! the wire, never the secret.

pub mod jwt;

pub use jwt::{
    JwtClaims, JwtError, JwtValidator, SharedSecret, DEFAULT_AUDIENCE, DEFAULT_ISSUER,
    MIN_SECRET_LEN,
};
