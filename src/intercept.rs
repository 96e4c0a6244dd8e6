//! The interceptor bridge: human-in-the-loop chunk editing
//!
//! At most one interactive session exists per process. Chunks a module asks
//! to intercept are serialized as space-separated hex, sent to the session
//! as one text message, and replaced by the hex-decoded reply. The session
//! slot sits behind a single mutex held across both the send and the
//! receive, so one chunk is in human review at a time, across all pipes and
//! directions.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

/// Intercept failure modes. All of them bypass interception for the chunk:
/// the caller forwards the original bytes and logs.
#[derive(Debug, Error)]
pub enum InterceptError {
    /// No interactive session is attached
    #[error("no interactive session attached")]
    NoSession,

    /// The session channel failed mid round trip
    #[error("intercept channel error: {0}")]
    Channel(String),

    /// The operator's reply was not valid hex
    #[error("failed to decode edited bytes: {0}")]
    Decode(#[from] hex::FromHexError),
}

/// A request/response text-message channel to the interactive operator.
///
/// Concretely a WebSocket (see the editor module); tests substitute
/// in-memory channels.
#[async_trait]
pub trait InterceptChannel: Send {
    async fn send_text(&mut self, text: String) -> Result<(), InterceptError>;
    async fn recv_text(&mut self) -> Result<String, InterceptError>;
}

/// Process-wide bridge between direction workers and the single interactive
/// session.
#[derive(Default)]
pub struct Interceptor {
    session: Mutex<Option<Box<dyn InterceptChannel>>>,
}

impl Interceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an interactive session, replacing any previous one.
    ///
    /// Waits for an in-flight round trip to finish rather than yanking the
    /// channel out from under it.
    pub async fn attach(&self, channel: Box<dyn InterceptChannel>) {
        let mut session = self.session.lock().await;
        if session.is_some() {
            info!("replacing existing interactive session");
        }
        *session = Some(channel);
    }

    /// Whether an interactive session is currently attached.
    pub async fn has_session(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Send `bytes` to the operator and return the edited replacement.
    ///
    /// Holds the session lock across the full round trip. A channel failure
    /// detaches the dead session.
    pub async fn intercept(&self, bytes: &[u8]) -> Result<Vec<u8>, InterceptError> {
        let mut session = self.session.lock().await;
        let mut channel = session.take().ok_or(InterceptError::NoSession)?;

        let result = round_trip(channel.as_mut(), bytes).await;
        match &result {
            // The channel is dead; leave the session detached.
            Err(InterceptError::Channel(_)) => {}
            _ => *session = Some(channel),
        }
        result
    }
}

async fn round_trip(
    channel: &mut dyn InterceptChannel,
    bytes: &[u8],
) -> Result<Vec<u8>, InterceptError> {
    channel.send_text(encode_hex(bytes)).await?;
    let reply = channel.recv_text().await?;
    decode_hex(&reply)
}

/// Encode bytes as two-hex-digit tokens separated by single spaces, e.g.
/// `48 65 6c 6c 6f`.
pub fn encode_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Decode an operator reply: any whitespace is ignored before hex decoding.
pub fn decode_hex(text: &str) -> Result<Vec<u8>, InterceptError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    Ok(hex::decode(compact)?)
}
