use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use mallory::config::Args;
use mallory::dispatch;
use mallory::editor;
use mallory::intercept::Interceptor;
use mallory::listener::ProxyListener;
use mallory::tls::TlsContext;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    // Certificate problems and port collisions are the two fatal startup
    // errors; everything past this point is recovered per connection.
    let tls = Arc::new(
        TlsContext::load(&args.cert_path, &args.key_path)
            .context("loading TLS identity")?,
    );

    let tcp_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.tcp_port));
    let tls_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.tls_port));
    let editor_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.editor_port));

    let tcp_listener = ProxyListener::bind_plain(tcp_addr)
        .await
        .context("binding TCP listener")?;
    let tls_listener = ProxyListener::bind_tls(tls_addr, &tls)
        .await
        .context("binding TLS listener")?;
    let editor_listener = TcpListener::bind(editor_addr)
        .await
        .with_context(|| format!("binding editor listener on {editor_addr}"))?;

    info!("mallory lives!");
    info!("listening for TLS connections on port {}", args.tls_port);
    info!(
        "listening for all other TCP connections on port {}",
        args.tcp_port
    );
    info!("intercept editor on http://localhost:{}/", args.editor_port);

    let module = args.module.instantiate();
    let interceptor = Arc::new(Interceptor::new());

    tokio::spawn(editor::serve(editor_listener, Arc::clone(&interceptor)));
    tokio::spawn(dispatch::dispatch(
        tls_listener,
        Arc::clone(&module),
        Arc::clone(&interceptor),
        Arc::clone(&tls),
        args.show,
    ));
    tokio::spawn(dispatch::dispatch(
        tcp_listener,
        module,
        interceptor,
        tls,
        args.show,
    ));

    shutdown_signal().await;
    info!("shutting down");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            info!("received SIGTERM");
        },
    }
}
