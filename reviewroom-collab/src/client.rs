//! WebSocket client for review sessions.
//!
//! Thin async wrapper around one server connection: translates outbound
//! calls into protocol frames and inbound frames into [`ClientEvent`]s on a
//! channel the application drains. Used by the integration tests and by
//! tooling; production viewers speak the same wire protocol directly.

use tokio::sync::mpsc;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientMessage, LayoutUpdate, ServerMessage};
use crate::store::LayoutDocument;

/// Events surfaced to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Authoritative layout state, sent right after connecting.
    Snapshot { version: u64, document: LayoutDocument },
    /// Someone published a new layout version.
    Updated {
        version: u64,
        document: LayoutDocument,
        published_by: String,
    },
    /// Our own publish was stale; carries the state to rebase against.
    Conflict { version: u64, document: LayoutDocument },
    /// Participant count changed.
    Presence { participant_count: usize },
    /// Server-reported error (connection stays open).
    ServerError { code: String, message: String },
    Pong,
    /// Connection ended; `code` is the close code when the server sent one.
    Closed { code: Option<u16> },
}

impl From<ServerMessage> for ClientEvent {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::Snapshot { version, document } => {
                ClientEvent::Snapshot { version, document }
            }
            ServerMessage::Updated {
                version,
                document,
                published_by,
            } => ClientEvent::Updated {
                version,
                document,
                published_by,
            },
            ServerMessage::Conflict { version, document } => {
                ClientEvent::Conflict { version, document }
            }
            ServerMessage::Presence { participant_count } => {
                ClientEvent::Presence { participant_count }
            }
            ServerMessage::Error { code, message } => ClientEvent::ServerError { code, message },
            ServerMessage::Pong => ClientEvent::Pong,
        }
    }
}

/// Client-side errors.
#[derive(Debug)]
pub enum ClientError {
    Connect(tokio_tungstenite::tungstenite::Error),
    /// The connection (or its writer task) is gone.
    ConnectionClosed,
    Protocol(crate::protocol::ProtocolError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Connect(e) => write!(f, "connect failed: {e}"),
            ClientError::ConnectionClosed => write!(f, "connection closed"),
            ClientError::Protocol(e) => write!(f, "protocol error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

/// A connected review session client.
pub struct CollabClient {
    outgoing_tx: mpsc::Sender<String>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl CollabClient {
    /// Connect to `{server_url}/ws/sessions/{session_id}?token={token}`.
    ///
    /// Spawns reader and writer tasks; events arrive on the receiver from
    /// [`take_event_rx`](Self::take_event_rx). Dropping the client closes
    /// the connection gracefully.
    pub async fn connect(
        server_url: &str,
        session_id: &str,
        token: &str,
    ) -> Result<Self, ClientError> {
        let url = format!("{server_url}/ws/sessions/{session_id}?token={token}");
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(ClientError::Connect)?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(64);
        let (event_tx, event_rx) = mpsc::channel::<ClientEvent>(256);

        // Writer task: drain the outgoing channel, then close the socket
        // once the client handle is dropped.
        tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: decode frames into events until the server closes
        tokio::spawn(async move {
            let mut close_code: Option<u16> = None;
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(msg) => {
                            if event_tx.send(msg.into()).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => log::warn!("undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(frame)) => {
                        close_code = frame.map(|f| u16::from(f.code));
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            let _ = event_tx.send(ClientEvent::Closed { code: close_code }).await;
        });

        Ok(Self {
            outgoing_tx,
            event_rx: Some(event_rx),
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Propose a layout edit based on `base_version`.
    pub async fn send_update(
        &self,
        base_version: u64,
        document: LayoutDocument,
    ) -> Result<(), ClientError> {
        self.send(ClientMessage::LayoutUpdate(LayoutUpdate {
            base_version,
            document,
        }))
        .await
    }

    pub async fn send_ping(&self) -> Result<(), ClientError> {
        self.send(ClientMessage::Ping).await
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        let text = msg.encode().map_err(ClientError::Protocol)?;
        self.send_raw(text).await
    }

    /// Send a raw text frame verbatim. Lets tests exercise the server's
    /// handling of malformed input.
    pub async fn send_raw(&self, text: String) -> Result<(), ClientError> {
        self.outgoing_tx
            .send(text)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }
}
