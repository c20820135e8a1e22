//! TLS material for the relay control listener
//!
//! Either loads a PEM certificate chain and key from disk, or generates an
//! ephemeral self-signed certificate when none is configured.

pub mod self_signed;

pub use self_signed::{generate_self_signed_cert, SelfSignedCertificate, SelfSignedError};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse certificates in {0}: {1}")]
    InvalidCertificate(String, std::io::Error),

    #[error("No certificates found in {0}")]
    NoCertificates(String),

    #[error("Failed to parse private key in {0}: {1}")]
    InvalidKey(String, std::io::Error),

    #[error("No private key found in {0}")]
    NoPrivateKey(String),

    #[error(transparent)]
    SelfSigned(#[from] SelfSignedError),
}

/// Certificate chain with private key
#[derive(Debug)]
pub struct Certificate {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl Certificate {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
        }
    }

    /// Load a PEM certificate chain and private key
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, CertError> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        let cert_chain = load_certs(cert_path)?;
        let private_key = load_private_key(key_path)?;

        tracing::debug!(
            cert = %cert_path.display(),
            chain_len = cert_chain.len(),
            "Loaded TLS certificate"
        );

        Ok(Self::new(cert_chain, private_key))
    }

    /// Clone the material (rustls key types are not `Clone` for the enum)
    pub fn clone_material(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            private_key: self.private_key.clone_key(),
        }
    }
}

impl From<SelfSignedCertificate> for Certificate {
    fn from(cert: SelfSignedCertificate) -> Self {
        Self::new(vec![cert.cert_der], cert.key_der)
    }
}

fn open(path: &Path) -> Result<BufReader<File>, CertError> {
    let file = File::open(path).map_err(|source| CertError::Open {
        path: path.display().to_string(),
        source,
    })?;
    Ok(BufReader::new(file))
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::InvalidCertificate(path.display().to_string(), e))?;

    if certs.is_empty() {
        return Err(CertError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| CertError::InvalidKey(path.display().to_string(), e))?
        .ok_or_else(|| CertError::NoPrivateKey(path.display().to_string()))
}
