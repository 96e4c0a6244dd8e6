//! Proxy error types

use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors raised while accepting, building, or driving pipes.
///
/// Only `Bind` and `CertLoad` abort startup; everything else is recovered
/// locally by terminating the smallest affected unit (an accept-loop
/// iteration, a pipe, or a single chunk).
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Listener could not bind its port
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// TLS identity could not be loaded
    #[error("failed to load TLS identity: {0}")]
    CertLoad(String),

    /// TLS handshake with an accepted client failed
    #[error("client TLS handshake failed: {0}")]
    Accept(String),

    /// The kernel had no original destination for the accepted socket
    #[error("failed to recover original destination: {0}")]
    OriginalDestination(std::io::Error),

    /// The client's intended destination could not be dialed
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        source: std::io::Error,
    },

    /// Mid-stream TLS upgrade handshake failed
    #[error("transport upgrade failed: {0}")]
    Upgrade(String),

    /// I/O error on a pipe transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation not available on this platform
    #[error("unsupported on this platform: {0}")]
    Unsupported(&'static str),
}

impl ProxyError {
    /// Create a bind error
    pub fn bind(addr: impl Into<String>, source: std::io::Error) -> Self {
        Self::Bind {
            addr: addr.into(),
            source,
        }
    }

    /// Create a dial error
    pub fn dial(addr: impl Into<String>, source: std::io::Error) -> Self {
        Self::Dial {
            addr: addr.into(),
            source,
        }
    }
}
