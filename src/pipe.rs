//! The pipe: a paired client/server transport with swappable ends
//!
//! A pipe is two byte streams (the accepted client connection and the dial
//! to that client's intended destination) plus the shared state its two
//! direction workers and its module need: a key/value context map, a user
//! mutex for module critical sections, and the TLS material for mid-stream
//! upgrades.
//!
//! Each end lives in a *slot*: a mutex-guarded `Option<BoxedTransport>`
//! with parked read/write wakers. The mutex is held only for the duration
//! of a single poll, so one worker can sit in a read on an end while the
//! other writes to it. Upgrade hooks `take` a transport out of its slot,
//! wrap it in TLS, and `set` the result back; a worker that polls an empty
//! slot parks until the replacement lands, which is what keeps the first
//! TLS record from being consumed by a stale plaintext read.

use std::collections::HashMap;
use std::future::{poll_fn, Future};
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::os::fd::RawFd;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::ProxyError;
use crate::origdst;
use crate::tls::TlsContext;

/// Hard per-operation deadline on pipe I/O.
///
/// Chosen so orphaned pipes self-reap without an external supervisor: any
/// stuck read or write fails within this window, which ends the worker and
/// closes the pipe.
pub const IO_TIMEOUT: Duration = Duration::from_secs(15);

/// A pipe end: anything byte-oriented, bidirectional, and pollable.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Owned, type-erased transport handle.
pub type BoxedTransport = Box<dyn Transport>;

/// Tagged value stored in a pipe's context map.
///
/// Modules carry state between hooks through the map; the tagging keeps the
/// store printable and comparable without trait objects.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl ContextValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<bool> for ContextValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ContextValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for ContextValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for ContextValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// Shared handle to a pipe's context map.
pub(crate) type ContextMap = Arc<Mutex<HashMap<String, ContextValue>>>;

#[derive(Default)]
struct SlotState {
    transport: Option<BoxedTransport>,
    closed: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

/// One end of the pipe.
struct Slot {
    state: Mutex<SlotState>,
}

impl Slot {
    fn new(transport: BoxedTransport) -> Self {
        Self {
            state: Mutex::new(SlotState {
                transport: Some(transport),
                ..SlotState::default()
            }),
        }
    }

    fn poll_read(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Poll::Ready(Err(closed_error()));
        }
        match state.transport.as_mut() {
            Some(t) => match Pin::new(t).poll_read(cx, buf) {
                Poll::Pending => {
                    // Parked so a swap can hand us the replacement transport.
                    state.read_waker = Some(cx.waker().clone());
                    Poll::Pending
                }
                ready => ready,
            },
            None => {
                state.read_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    fn poll_write(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Poll::Ready(Err(closed_error()));
        }
        match state.transport.as_mut() {
            Some(t) => match Pin::new(t).poll_write(cx, buf) {
                Poll::Pending => {
                    state.write_waker = Some(cx.waker().clone());
                    Poll::Pending
                }
                ready => ready,
            },
            None => {
                state.write_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    fn poll_flush(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Poll::Ready(Err(closed_error()));
        }
        match state.transport.as_mut() {
            Some(t) => match Pin::new(t).poll_flush(cx) {
                Poll::Pending => {
                    state.write_waker = Some(cx.waker().clone());
                    Poll::Pending
                }
                ready => ready,
            },
            None => {
                state.write_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        poll_fn(|cx| {
            let mut read_buf = ReadBuf::new(&mut buf[..]);
            match self.poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => Poll::Ready(Ok(read_buf.filled().len())),
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Pending,
            }
        })
        .await
    }

    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = poll_fn(|cx| self.poll_write(cx, &buf[written..])).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            written += n;
        }
        poll_fn(|cx| self.poll_flush(cx)).await
    }

    fn take(&self) -> Option<BoxedTransport> {
        self.state.lock().unwrap().transport.take()
    }

    fn replace(&self, transport: BoxedTransport) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            // Closed while the new transport was being built; dropping it
            // closes the descriptor.
            return;
        }
        state.transport = Some(transport);
        if let Some(w) = state.read_waker.take() {
            w.wake();
        }
        if let Some(w) = state.write_waker.take() {
            w.wake();
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        // Dropping the transport closes the underlying descriptor.
        state.transport = None;
        if let Some(w) = state.read_waker.take() {
            w.wake();
        }
        if let Some(w) = state.write_waker.take() {
            w.wake();
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "pipe closed")
}

/// A full-duplex proxied connection.
///
/// The client transparently connected to the proxy; the pipe dialed the
/// client's intended destination and passes traffic between the two, with
/// every chunk flowing through the module hook pipeline in between.
pub struct Pipe {
    id: u64,
    client: Slot,
    server: Slot,
    client_addr: SocketAddr,
    server_addr: SocketAddr,
    context: ContextMap,
    user_mutex: tokio::sync::Mutex<()>,
    tls: Arc<TlsContext>,
    io_timeout: Duration,
}

impl Pipe {
    /// Build a pipe for an accepted client connection.
    ///
    /// Recovers the client's original destination from the kernel, dials it
    /// (client-side TLS without verification when `use_tls`), and pairs the
    /// two transports. On any failure the client transport is dropped, which
    /// closes it.
    pub async fn connect(
        id: u64,
        client_fd: RawFd,
        client: BoxedTransport,
        client_addr: SocketAddr,
        use_tls: bool,
        tls: Arc<TlsContext>,
    ) -> Result<Pipe, ProxyError> {
        let dest = origdst::original_destination(client_fd)?;
        debug!(pipe = id, dest = %dest, "recovered original destination");

        let server = dial(dest, use_tls, &tls).await?;

        Ok(Self::from_parts(
            id,
            client,
            client_addr,
            server,
            SocketAddr::V4(dest),
            tls,
        ))
    }

    /// Pair two existing transports into a pipe.
    pub fn from_parts(
        id: u64,
        client: BoxedTransport,
        client_addr: SocketAddr,
        server: BoxedTransport,
        server_addr: SocketAddr,
        tls: Arc<TlsContext>,
    ) -> Pipe {
        Pipe {
            id,
            client: Slot::new(client),
            server: Slot::new(server),
            client_addr,
            server_addr,
            context: Arc::new(Mutex::new(HashMap::new())),
            user_mutex: tokio::sync::Mutex::new(()),
            tls,
            io_timeout: IO_TIMEOUT,
        }
    }

    /// Override the per-operation I/O deadline. Must be called before the
    /// pipe is shared with its workers.
    pub fn set_io_timeout(&mut self, timeout: Duration) {
        self.io_timeout = timeout;
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Peer address of the client end (the proxied device).
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Peer address of the server end (the client's intended destination).
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn tls(&self) -> &Arc<TlsContext> {
        &self.tls
    }

    /// Read from the client end under the I/O deadline.
    ///
    /// `Ok(0)` is end-of-stream; a timeout surfaces as `TimedOut` and is
    /// terminal for the calling worker.
    pub async fn read_from_client(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.deadline(self.client.read(buf)).await
    }

    /// Read from the server end under the I/O deadline.
    pub async fn read_from_server(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.deadline(self.server.read(buf)).await
    }

    /// Write to the client end under the I/O deadline.
    pub async fn write_to_client(&self, buf: &[u8]) -> io::Result<()> {
        self.deadline(self.client.write_all(buf)).await
    }

    /// Write to the server end under the I/O deadline.
    pub async fn write_to_server(&self, buf: &[u8]) -> io::Result<()> {
        self.deadline(self.server.write_all(buf)).await
    }

    /// Take the client transport out of its slot for wrapping.
    ///
    /// Readers and writers on this end park until a replacement is set.
    pub fn take_client_conn(&self) -> Option<BoxedTransport> {
        self.client.take()
    }

    /// Take the server transport out of its slot for wrapping.
    pub fn take_server_conn(&self) -> Option<BoxedTransport> {
        self.server.take()
    }

    /// Install a replacement client transport.
    ///
    /// The previous transport is not closed here; the upgrading module has
    /// already wrapped it into the replacement.
    pub fn set_client_conn(&self, transport: BoxedTransport) {
        self.client.replace(transport);
    }

    /// Install a replacement server transport.
    pub fn set_server_conn(&self, transport: BoxedTransport) {
        self.server.replace(transport);
    }

    /// Add a key/value pair to the pipe context. The map survives transport
    /// swaps.
    pub fn add_context(&self, key: impl Into<String>, value: impl Into<ContextValue>) {
        self.context
            .lock()
            .unwrap()
            .insert(key.into(), value.into());
    }

    /// Look up a context value.
    pub fn get_context(&self, key: &str) -> Option<ContextValue> {
        self.context.lock().unwrap().get(key).cloned()
    }

    /// Remove a key/value pair from the pipe context.
    pub fn delete_context(&self, key: &str) {
        self.context.lock().unwrap().remove(key);
    }

    pub(crate) fn context(&self) -> ContextMap {
        Arc::clone(&self.context)
    }

    /// Acquire the per-pipe user mutex, distinct from the lock guarding the
    /// transports and context. For module critical sections.
    pub async fn user_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.user_mutex.lock().await
    }

    /// Close both ends. Idempotent, and safe to call from either worker:
    /// the peer's outstanding read or write fails immediately.
    pub fn close(&self) {
        self.client.close();
        self.server.close();
    }

    /// Whether both ends have been closed.
    pub fn is_closed(&self) -> bool {
        self.client.is_closed() && self.server.is_closed()
    }

    async fn deadline<T>(
        &self,
        op: impl Future<Output = io::Result<T>>,
    ) -> io::Result<T> {
        match timeout(self.io_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "pipe I/O deadline exceeded",
            )),
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        self.close();
    }
}

/// Dial the recovered destination, optionally wrapping client-side TLS.
async fn dial(
    dest: SocketAddrV4,
    use_tls: bool,
    tls: &TlsContext,
) -> Result<BoxedTransport, ProxyError> {
    let stream = match timeout(IO_TIMEOUT, TcpStream::connect(dest)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ProxyError::dial(dest.to_string(), e)),
        Err(_) => {
            return Err(ProxyError::dial(
                dest.to_string(),
                io::ErrorKind::TimedOut.into(),
            ))
        }
    };

    if !use_tls {
        return Ok(Box::new(stream));
    }

    let name = ServerName::try_from(dest.ip().to_string())
        .map_err(|e| ProxyError::dial(dest.to_string(), io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    match timeout(IO_TIMEOUT, tls.connector().connect(name, stream)).await {
        Ok(Ok(stream)) => Ok(Box::new(stream)),
        Ok(Err(e)) => Err(ProxyError::dial(dest.to_string(), e)),
        Err(_) => Err(ProxyError::dial(
            dest.to_string(),
            io::ErrorKind::TimedOut.into(),
        )),
    }
}
