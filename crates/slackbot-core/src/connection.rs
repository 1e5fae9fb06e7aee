//! Realtime connection management.
//!
//! [`ConnectionManager`] performs the token handshake, opens the WebSocket
//! to the URL the backend hands back, and owns the resulting [`Session`].
//! The [`Transport`] trait is the seam the event loop drives, so the loop
//! can be exercised without a network.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderValue};
use tokio_tungstenite::tungstenite::http::header::{ORIGIN, SEC_WEBSOCKET_EXTENSIONS};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, instrument, warn};

use crate::codec::{self, Frame};
use crate::config::RealtimeConfig;
use crate::error::BotError;

/// Type alias for the WebSocket stream with optional TLS.
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The operations the event loop needs from a realtime connection.
///
/// Implementations must make [`next_frame`](Self::next_frame) cancel safe:
/// the loop races it against the outbound queue and drops it when an
/// outbound message wins.
#[async_trait]
pub trait Transport: Send {
    /// Waits for the next inbound frame.
    ///
    /// # Errors
    ///
    /// Returns `BotError::UnexpectedDisconnect` when the channel closed and a
    /// reconnect should follow, `BotError::Decode` for a single unreadable
    /// frame, or `BotError::Transport` for anything fatal.
    async fn next_frame(&mut self) -> Result<Frame, BotError>;

    /// Writes one frame.
    ///
    /// # Errors
    ///
    /// Returns `BotError::UnexpectedDisconnect` if the channel is closed, or
    /// `BotError::Transport` if the write fails.
    async fn send_frame(&mut self, frame: Frame) -> Result<(), BotError>;

    /// Re-establishes the session, retrying until it succeeds.
    async fn reconnect(&mut self);
}

/// Response body of the handshake endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub error: String,
}

/// One live realtime channel.
///
/// Replaced wholesale on reconnect; at most one exists per
/// [`ConnectionManager`].
pub struct Session {
    url: String,
    stream: WsStream,
}

impl Session {
    /// The URL this session was opened against.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("url", &self.url).finish()
    }
}

/// Owns the handshake and the current [`Session`].
///
/// # Examples
///
/// ```no_run
/// use slackbot_core::config::RealtimeConfig;
/// use slackbot_core::connection::ConnectionManager;
///
/// # async fn example() -> Result<(), slackbot_core::BotError> {
/// let mut conn = ConnectionManager::new(
///     "xoxb-token".into(),
///     "https://example.com".into(),
///     RealtimeConfig::default(),
/// );
/// conn.connect().await?;
/// let frame = conn.next_frame().await?;
/// println!("{}", frame.preview());
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManager {
    http: reqwest::Client,
    token: String,
    origin: String,
    settings: RealtimeConfig,
    session: Option<Session>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("origin", &self.origin)
            .field("handshake_url", &self.settings.handshake_url)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Creates a manager with no active session.
    pub fn new(token: String, origin: String, settings: RealtimeConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            origin,
            settings,
            session: None,
        }
    }

    /// Returns the active session, if any.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Returns the fixed delay between reconnect attempts.
    pub fn reconnect_interval(&self) -> Duration {
        self.settings.reconnect_interval()
    }

    /// Performs the handshake and opens a fresh session.
    ///
    /// Any existing session is closed first so two never coexist.
    ///
    /// # Errors
    ///
    /// Returns `BotError::Auth` if the backend rejects the token, or
    /// `BotError::Transport` if the HTTP or WebSocket step fails or the
    /// server accepts a WebSocket extension this client cannot speak.
    #[instrument(skip(self), fields(handshake_url = %self.settings.handshake_url))]
    pub async fn connect(&mut self) -> Result<(), BotError> {
        if let Some(mut old) = self.session.take() {
            debug!(url = old.url, "Closing previous session");
            let _ = old.stream.close(None).await;
        }

        let url = self.handshake().await?;
        info!("Handshake succeeded, opening realtime channel");

        let stream = self.open_channel(&url).await?;
        info!("Realtime channel connected");

        self.session = Some(Session { url, stream });
        Ok(())
    }

    /// Reconnects, retrying forever at a fixed interval.
    ///
    /// Each failed attempt is logged; there is no attempt cap and no backoff
    /// growth. Blocks the caller until a session is established.
    pub async fn reconnect(&mut self) {
        let interval = self.reconnect_interval();
        let mut attempt: u64 = 0;
        let mut last_error: Option<BotError> = None;

        loop {
            attempt += 1;
            match &last_error {
                Some(e) => warn!(error = %e, attempt, "Connect failed, reconnecting"),
                None => info!(attempt, "Connection lost, reconnecting"),
            }

            match self.connect().await {
                Ok(()) => {
                    info!(attempt, "Reconnected");
                    return;
                }
                Err(e) => last_error = Some(e),
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// Encodes an entity and writes it to the current session.
    ///
    /// # Errors
    ///
    /// Returns `BotError::Json` if encoding fails, and the errors of
    /// [`send_frame`](Transport::send_frame) otherwise.
    pub async fn send<T: Serialize + Sync>(&mut self, entity: &T) -> Result<(), BotError> {
        let frame = codec::encode(entity)?;
        self.write(frame).await
    }

    /// Waits for the next inbound text frame.
    ///
    /// Pings are answered and skipped. A closed, reset or ended stream, a
    /// close frame, a missing session, and a blank payload all surface as
    /// `BotError::UnexpectedDisconnect`.
    ///
    /// # Errors
    ///
    /// Returns `BotError::UnexpectedDisconnect`, `BotError::Decode` for a
    /// frame with reserved bits set, or `BotError::Transport`.
    pub async fn next_frame(&mut self) -> Result<Frame, BotError> {
        let Some(session) = self.session.as_mut() else {
            return Err(BotError::UnexpectedDisconnect);
        };

        loop {
            let Some(msg) = session.stream.next().await else {
                info!("Realtime stream ended");
                return Err(BotError::UnexpectedDisconnect);
            };

            let frame = match msg.map_err(classify_ws_error)? {
                WsMessage::Text(text) => Frame::new(text.as_str()),
                WsMessage::Binary(data) => Frame::new(String::from_utf8_lossy(&data)),
                WsMessage::Ping(data) => {
                    session
                        .stream
                        .send(WsMessage::Pong(data))
                        .await
                        .map_err(classify_ws_error)?;
                    continue;
                }
                WsMessage::Close(reason) => {
                    info!(reason = ?reason, "Received close frame");
                    return Err(BotError::UnexpectedDisconnect);
                }
                _ => continue,
            };

            if frame.is_blank() {
                debug!("Received blank frame, treating as disconnect");
                return Err(BotError::UnexpectedDisconnect);
            }
            return Ok(frame);
        }
    }

    async fn write(&mut self, frame: Frame) -> Result<(), BotError> {
        let Some(session) = self.session.as_mut() else {
            return Err(BotError::Transport("no active session".into()));
        };
        session
            .stream
            .send(WsMessage::Text(frame.into_string().into()))
            .await
            .map_err(classify_ws_error)
    }

    /// Exchanges the API token for a channel URL.
    async fn handshake(&self) -> Result<String, BotError> {
        let resp = self
            .http
            .post(&self.settings.handshake_url)
            .form(&[("token", self.token.as_str())])
            .send()
            .await
            .map_err(|e| BotError::Transport(format!("handshake request failed: {e}")))?;

        let body: HandshakeResponse = resp
            .json()
            .await
            .map_err(|e| BotError::Transport(format!("handshake response parse failed: {e}")))?;

        if !body.ok {
            warn!(error = body.error, "Handshake rejected");
            return Err(BotError::Auth(body.error));
        }
        if body.url.is_empty() {
            return Err(BotError::Transport("handshake response missing 'url'".into()));
        }
        Ok(body.url)
    }

    /// Opens the WebSocket with the origin and extension headers attached.
    ///
    /// The extension header is only an offer. Frames are read uncompressed,
    /// so a server that accepts any extension is refused here.
    async fn open_channel(&self, url: &str) -> Result<WsStream, BotError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| BotError::Transport(format!("invalid channel URL: {e}")))?;

        let headers = request.headers_mut();
        headers.insert(
            ORIGIN,
            HeaderValue::from_str(&self.origin)
                .map_err(|e| BotError::Transport(format!("invalid origin header: {e}")))?,
        );
        if !self.settings.extensions.is_empty() {
            headers.insert(
                SEC_WEBSOCKET_EXTENSIONS,
                HeaderValue::from_str(&self.settings.extensions)
                    .map_err(|e| BotError::Transport(format!("invalid extensions header: {e}")))?,
            );
        }

        let (mut stream, response) = connect_async(request)
            .await
            .map_err(|e| BotError::Transport(format!("WebSocket connect failed: {e}")))?;

        if let Some(accepted) = accepted_extensions(response.headers()) {
            warn!(extensions = accepted, "Server accepted an unsupported extension");
            let _ = stream.close(None).await;
            return Err(BotError::Transport(format!(
                "server accepted unsupported WebSocket extension '{accepted}'; \
                 set realtime.extensions to an empty string"
            )));
        }
        Ok(stream)
    }
}

/// Returns the extensions the server agreed to in its handshake response.
fn accepted_extensions(headers: &HeaderMap) -> Option<String> {
    let accepted = headers
        .get_all(SEC_WEBSOCKET_EXTENSIONS)
        .iter()
        .map(|value| String::from_utf8_lossy(value.as_bytes()).trim().to_string())
        .filter(|value| !value.is_empty())
        .collect::<Vec<_>>();
    (!accepted.is_empty()).then(|| accepted.join(", "))
}

#[async_trait]
impl Transport for ConnectionManager {
    async fn next_frame(&mut self) -> Result<Frame, BotError> {
        ConnectionManager::next_frame(self).await
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<(), BotError> {
        self.write(frame).await
    }

    async fn reconnect(&mut self) {
        ConnectionManager::reconnect(self).await;
    }
}

/// Splits WebSocket errors into "the channel went away" and everything else.
fn classify_ws_error(err: WsError) -> BotError {
    match err {
        WsError::ConnectionClosed
        | WsError::AlreadyClosed
        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            BotError::UnexpectedDisconnect
        }
        // Compressed frames from a session that never agreed to compression.
        WsError::Protocol(ProtocolError::NonZeroReservedBits) => {
            BotError::Decode("frame has reserved bits set".into())
        }
        WsError::Io(ref io)
            if matches!(
                io.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ) =>
        {
            BotError::UnexpectedDisconnect
        }
        other => BotError::Transport(format!("WebSocket error: {other}")),
    }
}
