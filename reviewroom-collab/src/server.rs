//! WebSocket server for shared review sessions.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── SessionRegistry ── Room (session_id)
//! Client B ──┘          │
//!                SessionConnection (per socket)
//!                       │
//!            ┌──────────┼──────────┐
//!            ▼          ▼          ▼
//!      TokenService  LayoutStore  SessionDirectory
//! ```
//!
//! One task per connection. The task owns the socket and the per-connection
//! [`SessionConnection`] state machine; everything shared lives behind the
//! [`CollabEngine`]. Connections attach at `/ws/sessions/{id}?token=...`.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::directory::SessionDirectory;
use crate::engine::{CollabEngine, SessionConnection};
use crate::protocol::CloseReason;
use crate::registry::{ConnectionHandle, SessionRegistry};
use crate::store::LayoutStore;
use crate::token::{MintedToken, Role, TokenConfig, TokenError, TokenService};

/// Env var overriding the bind address.
pub const BIND_ADDR_ENV: &str = "REVIEWROOM_BIND_ADDR";

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:9090";
const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Server configuration.
///
/// No `Default` impl: the token secret must always be supplied explicitly.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Token signing configuration
    pub token: TokenConfig,
    /// Outbound queue capacity per connection
    pub outbound_capacity: usize,
}

impl ServerConfig {
    pub fn new(token: TokenConfig) -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            token,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }

    pub fn bind_addr(mut self, bind_addr: impl Into<String>) -> Self {
        self.bind_addr = bind_addr.into();
        self
    }

    pub fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    /// Read configuration from the environment.
    pub fn from_env() -> Result<Self, TokenError> {
        let token = TokenConfig::from_env()?;
        let bind_addr =
            std::env::var(BIND_ADDR_ENV).unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
        Ok(Self::new(token).bind_addr(bind_addr))
    }
}

/// Server startup and runtime errors.
#[derive(Debug)]
pub enum ServerError {
    /// Token configuration was rejected (missing or insecure secret).
    Token(TokenError),
    Io(std::io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Token(e) => write!(f, "token configuration: {e}"),
            ServerError::Io(e) => write!(f, "io: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<TokenError> for ServerError {
    fn from(e: TokenError) -> Self {
        ServerError::Token(e)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Io(e)
    }
}

/// Parsed connect request: `/ws/sessions/{id}?token=...`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ConnectRequest {
    session_id: String,
    token: Option<String>,
}

/// Parse the request path and query. `None` means the path does not belong
/// to this server at all (404, not a protocol-level rejection).
fn parse_connect_request(path_and_query: &str) -> Option<ConnectRequest> {
    let (path, query) = match path_and_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_and_query, None),
    };

    let session_id = path
        .strip_prefix("/ws/sessions/")
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))?;

    let token = query.and_then(|q| {
        q.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == "token" && !value.is_empty()).then(|| value.to_string())
        })
    });

    Some(ConnectRequest {
        session_id: session_id.to_string(),
        token,
    })
}

/// The review session server.
pub struct CollabServer {
    config: ServerConfig,
    engine: Arc<CollabEngine>,
}

impl CollabServer {
    /// Build a server. Fails fast when the token secret is unusable —
    /// better a refused startup than a forgeable token.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn LayoutStore>,
        directory: Arc<dyn SessionDirectory>,
    ) -> Result<Self, ServerError> {
        let tokens = Arc::new(TokenService::new(config.token.clone())?);
        let registry = Arc::new(SessionRegistry::new());
        let engine = Arc::new(CollabEngine::new(tokens, registry, store, directory));
        Ok(Self { config, engine })
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn engine(&self) -> &Arc<CollabEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.engine.registry()
    }

    /// Issue a session-scoped connection token.
    pub fn mint_session_token(
        &self,
        session_id: &str,
        user_id: &str,
        role: Role,
    ) -> Result<MintedToken, TokenError> {
        self.engine.tokens().mint(session_id, user_id, role)
    }

    /// Issue a bearer token usable for any session the user belongs to.
    pub fn mint_bearer_token(
        &self,
        user_id: &str,
        role: Role,
    ) -> Result<MintedToken, TokenError> {
        self.engine.tokens().mint_bearer(user_id, role)
    }

    /// Start listening for WebSocket connections.
    ///
    /// Runs the accept loop forever; call from an async runtime, typically
    /// inside `tokio::spawn`.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("review session server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let engine = self.engine.clone();
            let capacity = self.config.outbound_capacity;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, engine, capacity).await {
                    log::debug!("connection from {addr} ended with error: {e}");
                }
            });
        }
    }
}

type WsError = tokio_tungstenite::tungstenite::Error;

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    engine: Arc<CollabEngine>,
    outbound_capacity: usize,
) -> Result<(), WsError> {
    // Capture the connect request during the HTTP upgrade; unknown paths
    // get a plain 404 before any WebSocket framing exists.
    let mut connect: Option<ConnectRequest> = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| {
            let path_and_query = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            match parse_connect_request(path_and_query) {
                Some(parsed) => {
                    connect = Some(parsed);
                    Ok(resp)
                }
                None => {
                    let mut not_found = ErrorResponse::new(None);
                    *not_found.status_mut() = StatusCode::NOT_FOUND;
                    Err(not_found)
                }
            }
        },
    )
    .await?;

    let Some(connect) = connect else {
        // Unreachable: the callback either fills this or rejects the upgrade
        return Ok(());
    };
    log::debug!(
        "websocket established from {addr} for session {}",
        connect.session_id
    );

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (handle, mut outbound_rx) = ConnectionHandle::new(outbound_capacity);
    let mut conn = engine.open(connect.session_id.clone(), handle);

    // Handshake: token first, membership second. A missing token fails the
    // same way a malformed one does.
    let token = connect.token.unwrap_or_default();
    if let Err(rejection) = conn.authenticate(&token).await {
        let reason = rejection.reason;
        if let Ok(text) = rejection.error_message().encode() {
            let _ = ws_sender.send(Message::Text(text.into())).await;
        }
        let _ = ws_sender
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(reason.code()),
                reason: reason.as_str().into(),
            })))
            .await;
        return Ok(());
    }

    if let Err(e) = conn.activate().await {
        log::error!("activation failed for session {}: {e}", connect.session_id);
        let _ = ws_sender.send(Message::Close(None)).await;
        conn.close().await;
        return Ok(());
    }

    let result = pump_connection(&mut conn, &mut ws_sender, &mut ws_receiver, &mut outbound_rx)
        .await;

    // Single teardown path for every exit
    conn.close().await;
    log::debug!("connection from {addr} closed");
    result
}

/// Drive an active connection until either side closes.
async fn pump_connection<S>(
    conn: &mut SessionConnection,
    ws_sender: &mut futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<S>,
        Message,
    >,
    ws_receiver: &mut futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<S>>,
    outbound_rx: &mut tokio::sync::mpsc::Receiver<crate::protocol::ServerMessage>,
) -> Result<(), WsError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        conn.handle_text(text.as_str()).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = ws_sender
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(CloseReason::Normal.code()),
                                reason: CloseReason::Normal.as_str().into(),
                            })))
                            .await;
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(e),
                    _ => {}
                }
            }

            outbound = outbound_rx.recv() => {
                // Engine and registry push frames through the handle; a
                // closed channel means the connection was torn down.
                let Some(msg) = outbound else { return Ok(()) };
                match msg.encode() {
                    Ok(text) => ws_sender.send(Message::Text(text.into())).await?,
                    Err(e) => {
                        log::error!(
                            "failed to encode outbound message for session {}: {e}",
                            conn.session_id()
                        );
                    }
                }
            }
        }
    }
}
