//! Listener pair tests: fd exposure and the TLS accept path

mod common;

use common::test_tls;
use mallory::listener::ProxyListener;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn plain_accept_exposes_the_socket_descriptor() {
    let listener = ProxyListener::bind_plain("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    assert!(!listener.is_tls());
    let addr = listener.local_addr().unwrap();

    let client = TcpStream::connect(addr).await.unwrap();
    let accepted = listener.accept().await.unwrap();

    assert!(accepted.fd >= 0);
    assert_eq!(accepted.peer, client.local_addr().unwrap());
}

#[tokio::test]
async fn tls_accept_completes_a_handshake_with_the_identity() {
    let tls = test_tls();
    let listener = ProxyListener::bind_tls("127.0.0.1:0".parse().unwrap(), &tls)
        .await
        .unwrap();
    assert!(listener.is_tls());
    let addr = listener.local_addr().unwrap();

    let connect = tokio::spawn({
        let tls = tls.clone();
        async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let name = ServerName::try_from("localhost").unwrap();
            let mut session = tls.connector().connect(name, stream).await.unwrap();
            session.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            session.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");
        }
    });

    let accepted = listener.accept().await.unwrap();
    assert!(accepted.fd >= 0);

    // The wrap the dispatcher performs in the per-connection task.
    let acceptor = listener.tls_acceptor().unwrap();
    let mut session = acceptor.accept(accepted.stream).await.unwrap();

    let mut buf = [0u8; 4];
    session.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    session.write_all(b"pong").await.unwrap();
    session.flush().await.unwrap();

    connect.await.unwrap();
}
