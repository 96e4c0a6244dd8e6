//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mallory::pipe::Pipe;
use mallory::tls::TlsContext;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::DuplexStream;

/// Self-signed identity for tests. Nothing in the proxy verifies
/// certificates, so the subject contents are irrelevant.
pub fn test_tls() -> Arc<TlsContext> {
    let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]);
    let cert = rcgen::Certificate::from_params(params).expect("generate certificate");
    let cert_der = CertificateDer::from(cert.serialize_der().expect("serialize certificate"));
    let key = PrivateKeyDer::Pkcs8(cert.serialize_private_key_der().into());
    Arc::new(TlsContext::from_parts(vec![cert_der], key).expect("build TLS context"))
}

/// A pipe over in-memory transports plus the test-side ends.
pub struct PipeHarness {
    pub pipe: Arc<Pipe>,
    /// Test side of the client end (plays the proxied device).
    pub client: DuplexStream,
    /// Test side of the server end (plays the intended destination).
    pub server: DuplexStream,
}

pub fn duplex_pipe(tls: Arc<TlsContext>) -> PipeHarness {
    duplex_pipe_with_timeout(tls, None)
}

pub fn duplex_pipe_with_timeout(tls: Arc<TlsContext>, timeout: Option<Duration>) -> PipeHarness {
    let (client_test, client_pipe) = tokio::io::duplex(65536);
    let (server_test, server_pipe) = tokio::io::duplex(65536);

    let mut pipe = Pipe::from_parts(
        1,
        Box::new(client_pipe),
        "127.0.0.1:40000".parse().unwrap(),
        Box::new(server_pipe),
        "127.0.0.1:50000".parse().unwrap(),
        tls,
    );
    if let Some(timeout) = timeout {
        pipe.set_io_timeout(timeout);
    }

    PipeHarness {
        pipe: Arc::new(pipe),
        client: client_test,
        server: server_test,
    }
}

/// Wait for both ends of the pipe to close.
pub async fn wait_closed(pipe: &Pipe) {
    for _ in 0..500 {
        if pipe.is_closed() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pipe did not close");
}
