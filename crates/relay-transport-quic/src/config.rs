//! QUIC transport configuration

use relay_cert::Certificate;
use relay_transport::{
    TransportConfig, TransportError, TransportResult, TransportSecurityConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Where the server's certificate comes from
#[derive(Debug, Clone)]
pub enum TlsMaterial {
    /// PEM files on disk, read when the listener is built
    Files { cert_path: PathBuf, key_path: PathBuf },
    /// Already-loaded material (self-signed or embedded)
    InMemory(Arc<Certificate>),
}

/// QUIC-specific configuration
#[derive(Debug, Clone)]
pub struct QuicConfig {
    security: TransportSecurityConfig,

    /// Server certificate (servers only)
    pub tls: Option<TlsMaterial>,

    /// Keep-alive interval
    pub keep_alive_interval: Duration,

    /// Maximum idle timeout
    pub max_idle_timeout: Duration,

    /// Maximum number of concurrent bidirectional streams the peer may open
    pub max_concurrent_streams: u64,

    /// Offer/accept 0-RTT resumption
    pub enable_0rtt: bool,
}

impl QuicConfig {
    fn base() -> Self {
        Self {
            security: TransportSecurityConfig::default(),
            tls: None,
            keep_alive_interval: Duration::from_secs(3),
            max_idle_timeout: Duration::from_secs(10),
            max_concurrent_streams: 1000,
            enable_0rtt: true,
        }
    }

    /// Client configuration verifying the relay against webpki roots
    pub fn client_default() -> Self {
        Self::base()
    }

    /// Client configuration for local development (skip cert verification)
    ///
    /// **INSECURE**: only for relays running with a self-signed certificate.
    pub fn client_insecure() -> Self {
        Self::client_default().with_insecure_skip_verify()
    }

    /// Server configuration reading PEM files
    pub fn server_with_files(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            tls: Some(TlsMaterial::Files {
                cert_path: cert_path.into(),
                key_path: key_path.into(),
            }),
            ..Self::base()
        }
    }

    /// Server configuration with already-loaded material
    pub fn server_with_certificate(cert: Certificate) -> Self {
        Self {
            tls: Some(TlsMaterial::InMemory(Arc::new(cert))),
            ..Self::base()
        }
    }

    /// Zero-config server with an ephemeral self-signed certificate
    ///
    /// The certificate lives only in memory and changes on every start, so
    /// agents need `client_insecure()` or must pin it.
    pub fn server_self_signed(extra_names: &[String]) -> TransportResult<Self> {
        let cert = relay_cert::generate_self_signed_cert(extra_names).map_err(|e| {
            TransportError::TlsError(format!("Failed to generate self-signed cert: {}", e))
        })?;
        Ok(Self::server_with_certificate(cert.into()))
    }

    /// Set custom keep-alive interval
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set custom idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    /// Set maximum concurrent streams
    pub fn with_max_streams(mut self, max: u64) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    /// Disable server certificate verification (INSECURE - only for testing!)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.security.verify_server_cert = false;
        self
    }

    /// Trust this DER certificate instead of the webpki roots
    pub fn with_root_certificate(mut self, der: Vec<u8>) -> Self {
        self.security.root_certs.push(der);
        self
    }

    /// Disable 0-RTT
    pub fn without_0rtt(mut self) -> Self {
        self.enable_0rtt = false;
        self
    }

    fn alpn(&self) -> Vec<Vec<u8>> {
        self.security
            .alpn_protocols
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect()
    }

    fn transport_config(&self) -> TransportResult<Arc<quinn::TransportConfig>> {
        let idle = quinn::IdleTimeout::try_from(self.max_idle_timeout).map_err(|e| {
            TransportError::ConfigurationError(format!("Invalid idle timeout: {}", e))
        })?;
        let streams = quinn::VarInt::try_from(self.max_concurrent_streams).map_err(|e| {
            TransportError::ConfigurationError(format!("Invalid stream limit: {}", e))
        })?;

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(idle));
        transport.max_concurrent_bidi_streams(streams);
        // Control traffic never uses unidirectional streams
        transport.max_concurrent_uni_streams(0u8.into());
        Ok(Arc::new(transport))
    }

    /// Build quinn ClientConfig
    pub(crate) fn build_client_config(&self) -> TransportResult<quinn::ClientConfig> {
        crate::ensure_crypto_provider();

        let mut roots = quinn::rustls::RootCertStore::empty();
        if self.security.root_certs.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for cert_der in &self.security.root_certs {
                roots
                    .add(quinn::rustls::pki_types::CertificateDer::from(
                        cert_der.clone(),
                    ))
                    .map_err(|e| {
                        TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                    })?;
            }
        }

        let mut client_crypto = if self.security.verify_server_cert {
            quinn::rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            quinn::rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        };

        client_crypto.alpn_protocols = self.alpn();
        // Session tickets are kept by the config's default in-memory store,
        // so every connect through the same connector can resume.
        client_crypto.enable_early_data = self.enable_0rtt;

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));
        client_config.transport_config(self.transport_config()?);

        Ok(client_config)
    }

    /// Build quinn ServerConfig
    pub(crate) fn build_server_config(&self) -> TransportResult<quinn::ServerConfig> {
        crate::ensure_crypto_provider();

        let material = self.tls.as_ref().ok_or_else(|| {
            TransportError::ConfigurationError("Server certificate required".to_string())
        })?;

        let cert = match material {
            TlsMaterial::Files {
                cert_path,
                key_path,
            } => Certificate::from_pem_files(cert_path, key_path)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
            TlsMaterial::InMemory(cert) => cert.clone_material(),
        };

        let mut server_crypto = quinn::rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert.cert_chain, cert.private_key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

        server_crypto.alpn_protocols = self.alpn();
        if self.enable_0rtt {
            // quinn only accepts 0 or u32::MAX here
            server_crypto.max_early_data_size = u32::MAX;
        }

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));
        server_config.transport_config(self.transport_config()?);

        Ok(server_config)
    }
}

impl TransportConfig for QuicConfig {
    fn security_config(&self) -> &TransportSecurityConfig {
        &self.security
    }

    fn validate(&self) -> TransportResult<()> {
        if self.keep_alive_interval.is_zero() {
            return Err(TransportError::ConfigurationError(
                "Keep-alive interval must be > 0".to_string(),
            ));
        }

        if self.max_idle_timeout < self.keep_alive_interval * 2 {
            return Err(TransportError::ConfigurationError(
                "Idle timeout must be at least 2x keep-alive interval".to_string(),
            ));
        }

        if self.max_concurrent_streams == 0 {
            return Err(TransportError::ConfigurationError(
                "At least one concurrent stream is required".to_string(),
            ));
        }

        Ok(())
    }
}

// Certificate verifier that skips verification (INSECURE - only for testing!)
#[derive(Debug)]
struct SkipVerification(Arc<quinn::rustls::crypto::CryptoProvider>);

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(Arc::new(quinn::rustls::crypto::ring::default_provider())))
    }
}

impl quinn::rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &quinn::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[quinn::rustls::pki_types::CertificateDer<'_>],
        _server_name: &quinn::rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: quinn::rustls::pki_types::UnixTime,
    ) -> Result<quinn::rustls::client::danger::ServerCertVerified, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &quinn::rustls::pki_types::CertificateDer<'_>,
        dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        quinn::rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &quinn::rustls::pki_types::CertificateDer<'_>,
        dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        quinn::rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<quinn::rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
