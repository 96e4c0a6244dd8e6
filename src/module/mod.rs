//! The module contract: byte-level policy over proxied traffic
//!
//! A module is a set of hooks invoked on every chunk a direction worker
//! reads, in a fixed order: `deserialize`, `should_drop`, `should_mangle` /
//! `mangle`, `should_intercept`, `should_print` / `pretty_print`,
//! `serialize`, then the before/after write hooks for whichever end the
//! chunk is headed to. Every hook has a no-op default so a module overrides
//! only what it cares about.
//!
//! The write hooks are async and receive the pipe: they are the authorized
//! points for mid-stream transport upgrades. See [`xmpp::StartTls`] for the
//! archetype.

pub mod xmpp;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;

use crate::pipe::{ContextMap, ContextValue, Pipe};
use crate::tls::TlsContext;

/// One chunk of proxied traffic plus the metadata a module needs to act on
/// it.
///
/// `bytes` may be replaced wholesale by `deserialize`, `mangle`,
/// interception, or `serialize`. The context handle is shared with the
/// owning pipe, so values written here are visible to hooks on the other
/// direction.
pub struct Data {
    /// True when the chunk came from the proxied device.
    pub from_client: bool,
    /// The chunk payload.
    pub bytes: BytesMut,
    /// Peer address of the client end.
    pub client_addr: SocketAddr,
    /// Peer address of the server end.
    pub server_addr: SocketAddr,
    context: ContextMap,
    tls: Arc<TlsContext>,
}

impl Data {
    /// Wrap a chunk read from one end of `pipe`.
    pub fn new(pipe: &Pipe, from_client: bool, chunk: &[u8]) -> Self {
        Self {
            from_client,
            bytes: BytesMut::from(chunk),
            client_addr: pipe.client_addr(),
            server_addr: pipe.server_addr(),
            context: pipe.context(),
            tls: Arc::clone(pipe.tls()),
        }
    }

    /// Address the chunk came from.
    pub fn source_addr(&self) -> SocketAddr {
        if self.from_client {
            self.client_addr
        } else {
            self.server_addr
        }
    }

    /// Address the chunk is headed to.
    pub fn dest_addr(&self) -> SocketAddr {
        if self.from_client {
            self.server_addr
        } else {
            self.client_addr
        }
    }

    /// Add a key/value pair to the owning pipe's context.
    pub fn add_context(&self, key: impl Into<String>, value: impl Into<ContextValue>) {
        self.context
            .lock()
            .unwrap()
            .insert(key.into(), value.into());
    }

    /// Look up a value in the owning pipe's context.
    pub fn get_context(&self, key: &str) -> Option<ContextValue> {
        self.context.lock().unwrap().get(key).cloned()
    }

    /// Remove a key/value pair from the owning pipe's context.
    pub fn delete_context(&self, key: &str) {
        self.context.lock().unwrap().remove(key);
    }

    /// The proxy's TLS material, for hooks performing transport upgrades.
    pub fn tls(&self) -> &Arc<TlsContext> {
        &self.tls
    }
}

/// The hook set a direction worker drives for every chunk.
///
/// Declared defaults: chunks are kept (`should_drop` false), not mangled,
/// not intercepted, and printed as a hexdump.
#[async_trait]
pub trait Module: Send + Sync {
    /// Structurally unpack the chunk (e.g. undo framing) before any policy
    /// decision.
    fn deserialize(&self, _data: &mut Data) {}

    /// When true the chunk is discarded and no further hook runs.
    fn should_drop(&self, _data: &Data) -> bool {
        false
    }

    /// When true, `mangle` runs on the chunk.
    fn should_mangle(&self, _data: &Data) -> bool {
        false
    }

    /// Modify or replace the chunk payload.
    fn mangle(&self, _data: &mut Data) {}

    /// When true the chunk is routed through the interceptor bridge for an
    /// interactive edit.
    fn should_intercept(&self, _data: &Data) -> bool {
        false
    }

    /// When true, `pretty_print` output is logged for this chunk.
    fn should_print(&self, _data: &Data) -> bool {
        true
    }

    /// Human-readable rendering of the chunk.
    fn pretty_print(&self, data: &Data) -> String {
        hexdump(&data.bytes)
    }

    /// Re-apply framing before the bytes leave the proxy.
    fn serialize(&self, _data: &mut Data) {}

    /// Runs immediately before a write to the client end.
    async fn before_write_to_client(&self, _data: &mut Data, _pipe: &Pipe) {}

    /// Runs after a successful write to the client end. The authorized point
    /// for client-side upgrades whose handshake must follow the forwarded
    /// acknowledgement.
    async fn after_write_to_client(&self, _data: &mut Data, _pipe: &Pipe) {}

    /// Runs immediately before a write to the server end.
    async fn before_write_to_server(&self, _data: &mut Data, _pipe: &Pipe) {}

    /// Runs after a successful write to the server end.
    async fn after_write_to_server(&self, _data: &mut Data, _pipe: &Pipe) {}
}

/// The default module: forwards everything untouched, printing each chunk.
pub struct Passthrough;

#[async_trait]
impl Module for Passthrough {}

/// Sixteen-bytes-per-line hexdump with an ASCII gutter.
pub fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in bytes.chunks(16).enumerate() {
        out.push_str(&format!("{:08x}  ", line * 16));
        for col in 0..16 {
            match chunk.get(col) {
                Some(b) => out.push_str(&format!("{b:02x} ")),
                None => out.push_str("   "),
            }
            if col == 7 {
                out.push(' ');
            }
        }
        out.push('|');
        for &b in chunk {
            out.push(if (0x20..0x7f).contains(&b) {
                b as char
            } else {
                '.'
            });
        }
        out.push_str("|\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hexdump_renders_ascii_gutter() {
        let dump = hexdump(b"Hello\x00world");
        assert!(dump.starts_with("00000000  48 65 6c 6c 6f 00 77 6f  72 6c 64"));
        assert!(dump.contains("|Hello.world|"));
    }

    #[test]
    fn hexdump_wraps_at_sixteen_bytes() {
        let dump = hexdump(&[0u8; 17]);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("00000010"));
    }

    #[test]
    fn hexdump_of_empty_chunk_is_empty() {
        assert_eq!(hexdump(b""), "");
    }
}
