//! Connection dispatch and the per-direction workers
//!
//! One dispatcher task runs per listener. Each accepted connection gets its
//! own task to finish the client-side TLS handshake (TLS listener only) and
//! build the pipe; a resolver or dial failure abandons just that
//! connection. A successful pipe gets two workers, one per direction, which
//! drive the module hook pipeline over every chunk until either side ends
//! the stream. Either worker exiting closes the pipe, which fails the
//! peer's outstanding I/O and brings both down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::intercept::Interceptor;
use crate::listener::{Accepted, ProxyListener};
use crate::module::{Data, Module};
use crate::pipe::{BoxedTransport, Pipe, IO_TIMEOUT};
use crate::tls::TlsContext;

/// Read buffer size per direction worker.
const CHUNK_CAPACITY: usize = 65535;

/// Process-wide pipe id counter; display/debug only.
static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(0);

/// Which way a worker moves bytes through the pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn from_client(self) -> bool {
        matches!(self, Direction::ClientToServer)
    }

    fn label(self) -> &'static str {
        match self {
            Direction::ClientToServer => "client->server",
            Direction::ServerToClient => "server->client",
        }
    }
}

/// Accept loop for one listener. Runs until the task is dropped.
pub async fn dispatch(
    listener: ProxyListener,
    module: Arc<dyn Module>,
    interceptor: Arc<Interceptor>,
    tls: Arc<TlsContext>,
    show: bool,
) {
    let label = if listener.is_tls() { "TLS" } else { "TCP" };
    loop {
        let accepted = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(listener = label, error = %e, "accept failed");
                continue;
            }
        };
        tokio::spawn(handle_connection(
            accepted,
            listener.tls_acceptor(),
            Arc::clone(&module),
            Arc::clone(&interceptor),
            Arc::clone(&tls),
            show,
            label,
        ));
    }
}

async fn handle_connection(
    accepted: Accepted,
    acceptor: Option<tokio_rustls::TlsAcceptor>,
    module: Arc<dyn Module>,
    interceptor: Arc<Interceptor>,
    tls: Arc<TlsContext>,
    show: bool,
    label: &'static str,
) {
    let id = NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed);
    let Accepted { fd, stream, peer } = accepted;
    let use_tls = acceptor.is_some();

    let client: BoxedTransport = match acceptor {
        Some(acceptor) => match timeout(IO_TIMEOUT, acceptor.accept(stream)).await {
            Ok(Ok(stream)) => Box::new(stream),
            Ok(Err(e)) => {
                warn!(pipe = id, peer = %peer, error = %e, "client TLS handshake failed");
                return;
            }
            Err(_) => {
                warn!(pipe = id, peer = %peer, "client TLS handshake timed out");
                return;
            }
        },
        None => Box::new(stream),
    };

    let pipe = match Pipe::connect(id, fd, client, peer, use_tls, tls).await {
        Ok(pipe) => pipe,
        Err(e) => {
            warn!(pipe = id, peer = %peer, error = %e, "error creating new pipe");
            return;
        }
    };

    if show {
        info!(pipe = id, peer = %peer, "{label} connection accepted");
    }

    spawn_workers(Arc::new(pipe), module, interceptor, show);
}

/// Start both direction workers for a pipe.
pub fn spawn_workers(
    pipe: Arc<Pipe>,
    module: Arc<dyn Module>,
    interceptor: Arc<Interceptor>,
    show: bool,
) {
    tokio::spawn(run_direction(
        Arc::clone(&pipe),
        Arc::clone(&module),
        Arc::clone(&interceptor),
        Direction::ClientToServer,
        show,
    ));
    tokio::spawn(run_direction(
        pipe,
        module,
        interceptor,
        Direction::ServerToClient,
        false,
    ));
}

/// Drive one direction of a pipe until the stream ends.
pub async fn run_direction(
    pipe: Arc<Pipe>,
    module: Arc<dyn Module>,
    interceptor: Arc<Interceptor>,
    direction: Direction,
    show: bool,
) {
    let mut buf = vec![0u8; CHUNK_CAPACITY];

    loop {
        let read = match direction {
            Direction::ClientToServer => pipe.read_from_client(&mut buf).await,
            Direction::ServerToClient => pipe.read_from_server(&mut buf).await,
        };
        let n = match read {
            // End of stream; no retry.
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(pipe = pipe.id(), direction = direction.label(), error = %e, "read ended");
                break;
            }
        };

        let mut data = Data::new(&pipe, direction.from_client(), &buf[..n]);

        module.deserialize(&mut data);

        if module.should_drop(&data) {
            continue;
        }

        if module.should_mangle(&data) {
            module.mangle(&mut data);
        }

        if module.should_intercept(&data) {
            match interceptor.intercept(&data.bytes).await {
                Ok(edited) => {
                    data.bytes.clear();
                    data.bytes.extend_from_slice(&edited);
                }
                Err(e) => {
                    warn!(pipe = pipe.id(), error = %e, "interception skipped, forwarding bytes unmodified");
                }
            }
        }

        if module.should_print(&data) {
            info!(
                "( {} ) {} -> {}\n{}",
                pipe.id(),
                data.source_addr(),
                data.dest_addr(),
                module.pretty_print(&data)
            );
        }

        module.serialize(&mut data);

        let written = match direction {
            Direction::ClientToServer => {
                module.before_write_to_server(&mut data, &pipe).await;
                let result = pipe.write_to_server(&data.bytes).await;
                if result.is_ok() {
                    module.after_write_to_server(&mut data, &pipe).await;
                }
                result
            }
            Direction::ServerToClient => {
                module.before_write_to_client(&mut data, &pipe).await;
                let result = pipe.write_to_client(&data.bytes).await;
                if result.is_ok() {
                    module.after_write_to_client(&mut data, &pipe).await;
                }
                result
            }
        };

        if let Err(e) = written {
            debug!(pipe = pipe.id(), direction = direction.label(), error = %e, "write ended");
            break;
        }
    }

    if show {
        info!(pipe = pipe.id(), "closing connection");
    }
    pipe.close();
}
