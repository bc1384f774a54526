//! TLS link configuration

use siptun_transport::security::load_certs;
use siptun_transport::{LinkSecurity, ReconnectConfig, TransportError, TransportResult};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// ALPN announced to the tunnel server
const ALPN_PROTOCOL: &str = "siptun-v1";

/// Tunables shared by every link a factory creates
#[derive(Debug, Clone)]
pub struct TlsLinkConfig {
    /// TCP connect + proxy + TLS handshake budget per server
    pub connect_timeout: Duration,

    /// Keep-alive interval (PING messages)
    pub keep_alive_interval: Duration,

    /// Outbound datagrams buffered while the link is busy or reconnecting
    pub outbound_queue: usize,

    /// Inbound datagrams buffered per virtual port
    pub port_queue: usize,

    /// Backoff between passes over the server list
    pub reconnect: ReconnectConfig,
}

impl Default for TlsLinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(30),
            outbound_queue: 256,
            port_queue: 128,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl TlsLinkConfig {
    /// Set custom keep-alive interval
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.outbound_queue == 0 || self.port_queue == 0 {
            return Err(TransportError::ConfigurationError(
                "Queue sizes must be > 0".to_string(),
            ));
        }
        if self.keep_alive_interval.is_zero() {
            return Err(TransportError::ConfigurationError(
                "Keep-alive interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Build the rustls connector for one link
pub(crate) fn build_tls_connector(
    security: &LinkSecurity,
) -> TransportResult<tokio_rustls::TlsConnector> {
    ensure_crypto_provider();

    let builder = if security.verify_server_cert {
        let roots = load_roots(security.root_ca.as_deref())?;
        rustls::ClientConfig::builder().with_root_certificates(roots)
    } else {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
    };

    let mut client_crypto = match &security.client_certificate {
        Some(client) => builder
            .with_client_auth_cert(client.chain.clone(), client.key().clone_key())
            .map_err(|e| TransportError::TlsError(format!("Invalid client cert/key: {}", e)))?,
        None => builder.with_no_client_auth(),
    };

    client_crypto.alpn_protocols = vec![ALPN_PROTOCOL.as_bytes().to_vec()];

    Ok(tokio_rustls::TlsConnector::from(Arc::new(client_crypto)))
}

fn load_roots(root_ca: Option<&Path>) -> TransportResult<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();

    match root_ca {
        Some(path) => {
            debug!("Loading tunnel root certificates from {}", path.display());
            let (added, ignored) = roots.add_parsable_certificates(load_certs(path)?);
            if ignored > 0 {
                warn!("Ignored {} unparsable root certificate(s)", ignored);
            }
            if added == 0 {
                return Err(TransportError::ConfigurationError(format!(
                    "No usable root certificate in {}",
                    path.display()
                )));
            }
        }
        None => {
            warn!("Server certificate verification enabled without a root CA, using platform roots");
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }

    Ok(roots)
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("Rustls crypto provider already installed");
        }
    });
}

// Certificate verifier used when verification is disabled
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
