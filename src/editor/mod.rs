//! The intercept editor: a browser-hosted hex editor over a WebSocket
//!
//! Serves a single-page hex editor and upgrades `/ws` into the interactive
//! session the interceptor bridge talks to. One session at a time; a new
//! browser tab replaces the previous session.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use async_trait::async_trait;

use crate::intercept::{InterceptChannel, InterceptError, Interceptor};

static EDITOR_PAGE: &str = include_str!("editor.html");

/// Serve the editor page and intercept channel on `listener` until the task
/// is dropped.
pub async fn serve(listener: TcpListener, interceptor: Arc<Interceptor>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "editor accept failed");
                continue;
            }
        };

        let interceptor = Arc::clone(&interceptor);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service =
                service_fn(move |req| handle_request(req, Arc::clone(&interceptor)));
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                debug!(peer = %peer, error = %e, "editor connection ended");
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    interceptor: Arc<Interceptor>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/html; charset=utf-8")
            .body(Full::new(Bytes::from_static(EDITOR_PAGE.as_bytes())))
            .unwrap(),
        (&Method::GET, "/ws") => upgrade_websocket(req, interceptor),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .unwrap(),
    };
    Ok(response)
}

/// Answer the WebSocket handshake and hand the upgraded stream to the
/// interceptor as the interactive session.
fn upgrade_websocket(
    mut req: Request<Incoming>,
    interceptor: Arc<Interceptor>,
) -> Response<Full<Bytes>> {
    let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY) else {
        return Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(Full::new(Bytes::from_static(b"missing Sec-WebSocket-Key")))
            .unwrap();
    };
    let accept = derive_accept_key(key.as_bytes());

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(
                    TokioIo::new(upgraded),
                    Role::Server,
                    None,
                )
                .await;
                info!("interactive session attached");
                interceptor.attach(Box::new(WsChannel { ws })).await;
            }
            Err(e) => warn!(error = %e, "websocket upgrade failed"),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// WebSocket-backed intercept channel.
struct WsChannel {
    ws: WebSocketStream<TokioIo<Upgraded>>,
}

#[async_trait]
impl InterceptChannel for WsChannel {
    async fn send_text(&mut self, text: String) -> Result<(), InterceptError> {
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| InterceptError::Channel(e.to_string()))
    }

    async fn recv_text(&mut self) -> Result<String, InterceptError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = self.ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(InterceptError::Channel("session closed".to_string()))
                }
                // Binary frames are not part of the protocol.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(InterceptError::Channel(e.to_string())),
            }
        }
    }
}
