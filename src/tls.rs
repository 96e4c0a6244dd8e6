//! TLS configuration for both halves of an intercepted connection
//!
//! The proxy carries one server-side identity (presented to every client,
//! who must be configured to trust it) and one upstream client config that
//! deliberately skips certificate verification: the proxy impersonates the
//! server to the real client and must tolerate whatever certificate the
//! true server presents.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::ProxyError;

/// Shared TLS material for a proxy process.
///
/// Held by every pipe so module hooks can build either side of a mid-stream
/// transport upgrade.
pub struct TlsContext {
    server: Arc<ServerConfig>,
    upstream: Arc<ClientConfig>,
}

impl TlsContext {
    /// Load the identity from PEM files on disk.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, ProxyError> {
        let (certs, key) = load_certs_and_key(cert_path, key_path)?;
        Self::from_parts(certs, key)
    }

    /// Build from an already-loaded identity.
    pub fn from_parts(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, ProxyError> {
        if certs.is_empty() {
            return Err(ProxyError::CertLoad(
                "no certificates in identity".to_string(),
            ));
        }

        let server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ProxyError::CertLoad(e.to_string()))?;

        let upstream = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth();

        Ok(Self {
            server: Arc::new(server),
            upstream: Arc::new(upstream),
        })
    }

    /// Acceptor presenting the proxy's identity to clients.
    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.server))
    }

    /// Connector for dialing the true server without verifying it.
    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(Arc::clone(&self.upstream))
    }
}

/// Load a PEM certificate chain and private key from files
fn load_certs_and_key(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ProxyError> {
    let cert_file = File::open(cert_path)
        .map_err(|e| ProxyError::CertLoad(format!("{}: {e}", cert_path.display())))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::CertLoad(format!("{}: {e}", cert_path.display())))?;

    if certs.is_empty() {
        return Err(ProxyError::CertLoad(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key_file = File::open(key_path)
        .map_err(|e| ProxyError::CertLoad(format!("{}: {e}", key_path.display())))?;
    let mut key_reader = BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ProxyError::CertLoad(format!("{}: {e}", key_path.display())))?
        .ok_or_else(|| {
            ProxyError::CertLoad(format!("no private key found in {}", key_path.display()))
        })?;

    Ok((certs, key))
}

/// Upstream certificate verifier that accepts anything.
///
/// The client believed it was talking to the original server; the proxy dials
/// that server on its behalf and has no trust anchor to check it against.
#[derive(Debug)]
struct NoVerification;

impl rustls::client::danger::ServerCertVerifier for NoVerification {
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
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ED448,
        ]
    }
}
