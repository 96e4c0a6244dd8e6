//! The listener pair: plaintext and TLS accept points
//!
//! Both listeners expose the accepted socket's file descriptor alongside the
//! stream: the original-destination lookup needs the raw socket, and the
//! socket's own addresses are useless for that (they all point at the
//! proxy). The TLS listener carries an acceptor; the server-side handshake
//! runs in the per-connection task so a slow client cannot stall the accept
//! loop.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::error::ProxyError;
use crate::tls::TlsContext;

/// An accepted client connection, pre-wrap.
pub struct Accepted {
    /// Raw descriptor for the original-destination lookup.
    pub fd: RawFd,
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

/// A bound accept point, optionally wrapping clients in TLS.
pub struct ProxyListener {
    inner: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl ProxyListener {
    /// Bind a plaintext listener. Bind failure is fatal.
    pub async fn bind_plain(addr: SocketAddr) -> Result<Self, ProxyError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::bind(addr.to_string(), e))?;
        Ok(Self { inner, tls: None })
    }

    /// Bind a TLS listener presenting the proxy's identity.
    pub async fn bind_tls(addr: SocketAddr, tls: &TlsContext) -> Result<Self, ProxyError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::bind(addr.to_string(), e))?;
        Ok(Self {
            inner,
            tls: Some(tls.acceptor()),
        })
    }

    /// Accept one connection. Errors are non-fatal; the dispatcher logs and
    /// keeps accepting.
    pub async fn accept(&self) -> std::io::Result<Accepted> {
        let (stream, peer) = self.inner.accept().await?;
        let fd = stream.as_raw_fd();
        Ok(Accepted { fd, stream, peer })
    }

    /// The acceptor to apply to accepted clients, if this is the TLS
    /// listener.
    pub fn tls_acceptor(&self) -> Option<TlsAcceptor> {
        self.tls.clone()
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
