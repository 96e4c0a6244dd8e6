//! End-to-end XMPP STARTTLS upgrade: both halves of the pipe move from
//! plaintext to TLS mid-stream and traffic keeps flowing through the hook
//! pipeline afterwards.

mod common;

use std::sync::Arc;

use common::{duplex_pipe, test_tls, wait_closed};
use mallory::dispatch::spawn_workers;
use mallory::intercept::Interceptor;
use mallory::module::xmpp::StartTls;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const STARTTLS: &[u8] = b"<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>";
const PROCEED: &[u8] = b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>";

#[tokio::test]
async fn starttls_upgrades_both_halves_of_the_pipe() {
    let tls = test_tls();
    let harness = duplex_pipe(Arc::clone(&tls));
    let pipe = Arc::clone(&harness.pipe);

    spawn_workers(
        Arc::clone(&harness.pipe),
        Arc::new(StartTls),
        Arc::new(Interceptor::new()),
        false,
    );

    // The real XMPP server: answers STARTTLS with proceed, then expects the
    // proxy to complete a TLS handshake and deliver the stanza inside it.
    let server_tls = Arc::clone(&tls);
    let mut server = harness.server;
    let server_task = tokio::spawn(async move {
        let mut buf = vec![0u8; 1024];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], STARTTLS);

        server.write_all(PROCEED).await.unwrap();

        let mut session = server_tls.acceptor().accept(server).await.unwrap();

        let n = session.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"<message>hi</message>");

        session.write_all(b"<ack/>").await.unwrap();
        session
    });

    // The proxied client: sends STARTTLS in plaintext, reads the proceed,
    // then speaks TLS on the same connection.
    let mut client = harness.client;
    client.write_all(STARTTLS).await.unwrap();

    let mut buf = vec![0u8; 1024];
    let n = client.read(&mut buf).await.unwrap();
    // The proceed element passes through the proxy unchanged.
    assert_eq!(&buf[..n], PROCEED);

    let name = ServerName::try_from("localhost").unwrap();
    let mut session = tls
        .connector()
        .connect(name, client)
        .await
        .expect("client-side TLS handshake through the proxy");

    session.write_all(b"<message>hi</message>").await.unwrap();

    let n = session.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"<ack/>");

    // Keep the server's session alive until the exchange is done.
    let _server_session = server_task.await.unwrap();

    // Client hangup tears the whole pipe down.
    drop(session);
    wait_closed(&pipe).await;
}
