//! XMPP STARTTLS interception
//!
//! XMPP streams begin in plaintext and negotiate TLS in-band: the client
//! sends `<starttls/>`, the server answers `<proceed/>`, and both ends then
//! speak TLS on the same TCP connection. To keep sight of the decrypted
//! stream the proxy must upgrade both halves of the pipe at exactly that
//! moment: the client-side upgrade happens after the `<proceed/>` has been
//! forwarded (the client's next bytes are its ClientHello), and the
//! server-side upgrade happens before the next byte is forwarded upstream.

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::time::timeout;
use tracing::{error, info};

use crate::module::{Data, Module};
use crate::pipe::{Pipe, IO_TIMEOUT};

const PROCEED_SINGLE: &[u8] = b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>";
const PROCEED_DOUBLE: &[u8] = b"<proceed xmlns=\"urn:ietf:params:xml:ns:xmpp-tls\"/>";

/// Context flag: the client half of the pipe must be upgraded to TLS.
pub const UPGRADE_CLIENT_CONNECTION: &str = "UpgradeClientConnection";
/// Context flag: the server half of the pipe must be upgraded to TLS.
pub const UPGRADE_SERVER_CONNECTION: &str = "UpgradeServerConnection";

/// Port of the proxied XMPP service; only its traffic gets printed.
const XMPP_PORT: u16 = 5225;

/// Module that follows an XMPP session through its STARTTLS upgrade.
pub struct StartTls;

fn contains_proceed(bytes: &[u8]) -> bool {
    contains(bytes, PROCEED_SINGLE) || contains(bytes, PROCEED_DOUBLE)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn flag_set(data: &Data, key: &str) -> bool {
    data.get_context(key).and_then(|v| v.as_bool()) == Some(true)
}

#[async_trait]
impl Module for StartTls {
    fn should_print(&self, data: &Data) -> bool {
        data.server_addr.port() == XMPP_PORT || data.client_addr.port() == XMPP_PORT
    }

    async fn before_write_to_client(&self, data: &mut Data, _pipe: &Pipe) {
        if !data.from_client && contains_proceed(&data.bytes) {
            // The server has told the client to begin TLS. The proceed
            // element itself passes through untouched; both halves of the
            // pipe get upgraded around it.
            data.add_context(UPGRADE_CLIENT_CONNECTION, true);
            data.add_context(UPGRADE_SERVER_CONNECTION, true);
        }
    }

    async fn after_write_to_client(&self, data: &mut Data, pipe: &Pipe) {
        if !flag_set(data, UPGRADE_CLIENT_CONNECTION) {
            return;
        }

        // The proceed element has been forwarded; the client's next bytes
        // are its ClientHello. Taking the transport parks the opposite
        // worker until the handshake lands the TLS stream back in the slot.
        let Some(transport) = pipe.take_client_conn() else {
            error!(pipe = pipe.id(), "client transport unavailable for upgrade");
            pipe.close();
            return;
        };

        match timeout(IO_TIMEOUT, data.tls().acceptor().accept(transport)).await {
            Ok(Ok(stream)) => {
                pipe.set_client_conn(Box::new(stream));
                data.add_context(UPGRADE_CLIENT_CONNECTION, false);
                info!(pipe = pipe.id(), "upgraded client-side connection");
            }
            Ok(Err(e)) => {
                error!(pipe = pipe.id(), error = %e, "failure upgrading client-side connection");
                pipe.close();
            }
            Err(_) => {
                error!(pipe = pipe.id(), "client-side upgrade handshake timed out");
                pipe.close();
            }
        }
    }

    async fn before_write_to_server(&self, data: &mut Data, pipe: &Pipe) {
        if !flag_set(data, UPGRADE_SERVER_CONNECTION) {
            return;
        }

        let Some(transport) = pipe.take_server_conn() else {
            error!(pipe = pipe.id(), "server transport unavailable for upgrade");
            pipe.close();
            return;
        };

        let name = match ServerName::try_from(pipe.server_addr().ip().to_string()) {
            Ok(name) => name,
            Err(e) => {
                error!(pipe = pipe.id(), error = %e, "invalid upstream server name");
                pipe.close();
                return;
            }
        };

        match timeout(IO_TIMEOUT, data.tls().connector().connect(name, transport)).await {
            Ok(Ok(stream)) => {
                pipe.set_server_conn(Box::new(stream));
                data.add_context(UPGRADE_SERVER_CONNECTION, false);
                info!(pipe = pipe.id(), "upgraded server-side connection");
            }
            Ok(Err(e)) => {
                error!(pipe = pipe.id(), error = %e, "failure upgrading server-side connection");
                pipe.close();
            }
            Err(_) => {
                error!(pipe = pipe.id(), "server-side upgrade handshake timed out");
                pipe.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::Pipe;
    use crate::tls::TlsContext;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use std::sync::Arc;

    fn test_pipe(client_addr: &str, server_addr: &str) -> Pipe {
        let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]);
        let cert = rcgen::Certificate::from_params(params).unwrap();
        let cert_der = CertificateDer::from(cert.serialize_der().unwrap());
        let key = PrivateKeyDer::Pkcs8(cert.serialize_private_key_der().into());
        let tls = Arc::new(TlsContext::from_parts(vec![cert_der], key).unwrap());

        let (_client_test, client) = tokio::io::duplex(64);
        let (_server_test, server) = tokio::io::duplex(64);
        Pipe::from_parts(
            1,
            Box::new(client),
            client_addr.parse().unwrap(),
            Box::new(server),
            server_addr.parse().unwrap(),
            tls,
        )
    }

    #[test]
    fn printing_is_gated_on_the_xmpp_port() {
        let pipe = test_pipe("10.0.0.2:40000", "10.0.0.9:5225");
        let data = Data::new(&pipe, true, b"<presence/>");
        assert!(StartTls.should_print(&data));

        let pipe = test_pipe("10.0.0.2:5225", "10.0.0.9:40000");
        let data = Data::new(&pipe, false, b"<presence/>");
        assert!(StartTls.should_print(&data));

        let pipe = test_pipe("10.0.0.2:40000", "10.0.0.9:443");
        let data = Data::new(&pipe, true, b"GET / HTTP/1.1");
        assert!(!StartTls.should_print(&data));
    }

    #[test]
    fn proceed_detection_accepts_both_quote_styles() {
        assert!(contains_proceed(
            b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>"
        ));
        assert!(contains_proceed(
            b"junk<proceed xmlns=\"urn:ietf:params:xml:ns:xmpp-tls\"/>junk"
        ));
        assert!(!contains_proceed(
            b"<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>"
        ));
        assert!(!contains_proceed(b""));
    }
}
