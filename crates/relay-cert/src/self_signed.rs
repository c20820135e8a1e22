//! Self-signed certificate generation for development and testing
//!
//! Used when the relay starts without a configured certificate. Agents must
//! then connect with certificate verification disabled or pin the cert.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SerialNumber};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SelfSignedError {
    #[error("Certificate generation failed: {0}")]
    GenerationFailed(#[from] rcgen::Error),

    #[error("Invalid validity window: {0}")]
    InvalidValidity(String),
}

/// Validity of generated certificates
const VALIDITY_DAYS: i64 = 90;

/// Generate a self-signed certificate for the given names
///
/// `localhost`, `127.0.0.1` and `::1` are always included. Names that parse
/// as IP addresses become IP SANs, everything else a DNS SAN.
pub fn generate_self_signed_cert(
    names: &[String],
) -> Result<SelfSignedCertificate, SelfSignedError> {
    let mut sans: Vec<String> = vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ];
    for name in names {
        if !sans.contains(name) {
            sans.push(name.clone());
        }
    }

    let mut params = CertificateParams::new(sans)?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Relay Development Certificate");
    dn.push(DnType::OrganizationName, "Tunnel Relay");
    params.distinguished_name = dn;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now
        .checked_sub(time::Duration::minutes(5))
        .ok_or_else(|| SelfSignedError::InvalidValidity("not_before underflow".to_string()))?;
    params.not_after = now
        .checked_add(time::Duration::days(VALIDITY_DAYS))
        .ok_or_else(|| SelfSignedError::InvalidValidity("not_after overflow".to_string()))?;

    params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    Ok(SelfSignedCertificate {
        cert_der: cert.der().clone(),
        key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
    })
}

/// A self-signed certificate with its private key
pub struct SelfSignedCertificate {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
    pub pem_cert: String,
    pub pem_key: String,
}

impl SelfSignedCertificate {
    /// Save certificate and key to PEM files
    pub fn save_to_files(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> std::io::Result<()> {
        std::fs::write(cert_path, &self.pem_cert)?;
        std::fs::write(key_path, &self.pem_key)?;
        Ok(())
    }
}

impl std::fmt::Debug for SelfSignedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfSignedCertificate")
            .field("cert_len", &self.cert_der.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_self_signed_cert() {
        let cert = generate_self_signed_cert(&[]).unwrap();

        assert!(!cert.cert_der.is_empty());
        assert!(cert.pem_cert.contains("BEGIN CERTIFICATE"));
        assert!(cert.pem_key.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn test_extra_names_accepted() {
        let cert = generate_self_signed_cert(&[
            "relay.example.com".to_string(),
            "10.0.0.1".to_string(),
            "localhost".to_string(),
        ]);
        assert!(cert.is_ok());
    }

    #[test]
    fn test_cert_can_be_used_with_rustls() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let cert = generate_self_signed_cert(&[]).unwrap();

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.cert_der], cert.key_der);

        assert!(server_config.is_ok());
    }
}
