//! Mallory - transparent TCP/TLS interception proxy
//!
//! Mallory sits between a proxy-unaware client and the servers it talks to.
//! Traffic reaches it through a kernel redirect rule (NAT REDIRECT); for
//! every connection it recovers the client's original destination from the
//! kernel, dials that destination on the client's behalf, and forwards
//! bytes both ways. In between, each chunk flows through a module pipeline
//! that can inspect, transform, drop, or hand the bytes to a human in a
//! browser-hosted hex editor, and that can upgrade either half of the
//! connection from plaintext to TLS mid-stream (XMPP STARTTLS).
//!
//! ## Architecture
//!
//! - `listener` - the plaintext/TLS accept points, exposing the accepted fd
//! - `origdst` - original-destination recovery (`SO_ORIGINAL_DST`)
//! - `pipe` - the paired transports with swappable ends and shared context
//! - `dispatch` - per-listener accept loops and per-direction workers
//! - `module` - the hook contract and the bundled modules
//! - `intercept` - the single-session human-in-the-loop edit bridge
//! - `editor` - the browser hex editor and its WebSocket channel
//! - `tls` - identity loading, server-side and (unverified) upstream configs

pub mod config;
pub mod dispatch;
pub mod editor;
pub mod error;
pub mod intercept;
pub mod listener;
pub mod module;
pub mod origdst;
pub mod pipe;
pub mod tls;

pub use config::{Args, ModuleKind};
pub use dispatch::{dispatch, run_direction, spawn_workers, Direction};
pub use error::ProxyError;
pub use intercept::{InterceptChannel, InterceptError, Interceptor};
pub use listener::{Accepted, ProxyListener};
pub use module::{Data, Module, Passthrough};
pub use pipe::{BoxedTransport, ContextValue, Pipe, Transport, IO_TIMEOUT};
pub use tls::TlsContext;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "mallory");
    }
}
