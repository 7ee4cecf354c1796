//! Per-connection protocol engine.
//!
//! State machine, one instance per connection, owned by its transport task:
//!
//! ```text
//! Connecting ──authenticate()──► Authenticated ──activate()──► Active
//!     │                              │                           │
//!     └──────────────┬───────────────┘                           │
//!                    ▼                                           ▼
//!                  Closed ◄────────────close()───────────────────┘
//! ```
//!
//! There is no Reconnecting state: a dropped transport always produces a
//! fresh connection and a fresh handshake.
//!
//! Authentication is two independent checks — token verification, then a
//! session-membership lookup against the external directory — and neither
//! touches the registry. Only `activate()` joins, and `close()` is the
//! single, idempotent teardown path.

use std::sync::Arc;

use crate::directory::SessionDirectory;
use crate::protocol::{error_code, ClientMessage, CloseReason, LayoutUpdate, ServerMessage};
use crate::registry::{ConnectionHandle, SessionRegistry};
use crate::store::{AppendOutcome, LayoutStore};
use crate::token::{Claims, TokenKind, TokenService};

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Authenticated,
    Active,
    Closed,
}

/// Handshake failure: the connection must be closed with this reason and
/// no registry state was touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRejection {
    pub reason: CloseReason,
}

impl HandshakeRejection {
    fn new(reason: CloseReason) -> Self {
        Self { reason }
    }

    /// The `error` message sent before closing.
    pub fn error_message(&self) -> ServerMessage {
        match self.reason {
            CloseReason::InvalidToken | CloseReason::SessionMismatch => ServerMessage::error(
                error_code::INVALID_WS_TOKEN,
                "connection token was not accepted",
            ),
            CloseReason::NotAMember | CloseReason::Normal => ServerMessage::error(
                error_code::SESSION_NOT_FOUND,
                "session not found",
            ),
        }
    }
}

impl std::fmt::Display for HandshakeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handshake rejected: {}", self.reason.as_str())
    }
}

impl std::error::Error for HandshakeRejection {}

/// Shared engine state: one per process, cloned into every connection task
/// via `Arc`.
pub struct CollabEngine {
    tokens: Arc<TokenService>,
    registry: Arc<SessionRegistry>,
    store: Arc<dyn LayoutStore>,
    directory: Arc<dyn SessionDirectory>,
}

impl CollabEngine {
    pub fn new(
        tokens: Arc<TokenService>,
        registry: Arc<SessionRegistry>,
        store: Arc<dyn LayoutStore>,
        directory: Arc<dyn SessionDirectory>,
    ) -> Self {
        Self {
            tokens,
            registry,
            store,
            directory,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Open a new connection in the `Connecting` phase.
    pub fn open(
        self: &Arc<Self>,
        session_id: impl Into<String>,
        handle: ConnectionHandle,
    ) -> SessionConnection {
        SessionConnection {
            engine: self.clone(),
            session_id: session_id.into(),
            handle,
            phase: Phase::Connecting,
            claims: None,
        }
    }
}

/// The per-connection state machine.
pub struct SessionConnection {
    engine: Arc<CollabEngine>,
    session_id: String,
    handle: ConnectionHandle,
    phase: Phase,
    claims: Option<Claims>,
}

impl SessionConnection {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Verified claims; `None` until authentication succeeds.
    pub fn claims(&self) -> Option<&Claims> {
        self.claims.as_ref()
    }

    /// `Connecting → Authenticated`: verify the token, then confirm session
    /// membership with the directory. Performs no registry mutation.
    pub async fn authenticate(&mut self, token: &str) -> Result<(), HandshakeRejection> {
        if self.phase != Phase::Connecting {
            return Err(HandshakeRejection::new(CloseReason::InvalidToken));
        }

        // Either token class is acceptable on connect; bearer tokens simply
        // carry no session scope of their own.
        let claims = self
            .engine
            .tokens
            .verify(token, TokenKind::Session)
            .or_else(|err| {
                if err.reason() == crate::token::InvalidReason::WrongKind {
                    self.engine.tokens.verify(token, TokenKind::Bearer)
                } else {
                    Err(err)
                }
            })
            .map_err(|err| {
                log::info!(
                    "rejected connection to session {}: token {:?}",
                    self.session_id,
                    err.reason()
                );
                HandshakeRejection::new(CloseReason::InvalidToken)
            })?;

        // A session token is a capability for exactly one session; a valid
        // token for session A never grants access to session B.
        if claims.kind == TokenKind::Session
            && claims.session_id.as_deref() != Some(self.session_id.as_str())
        {
            log::info!(
                "rejected connection: token scoped to {:?}, requested {}",
                claims.session_id,
                self.session_id
            );
            return Err(HandshakeRejection::new(CloseReason::SessionMismatch));
        }

        // Second, independent authorization check against the collaborator
        if !self
            .engine
            .directory
            .is_member(&self.session_id, &claims.user_id)
            .await
        {
            log::info!(
                "rejected connection: {} is not a member of session {}",
                claims.user_id,
                self.session_id
            );
            return Err(HandshakeRejection::new(CloseReason::NotAMember));
        }

        self.claims = Some(claims);
        self.phase = Phase::Authenticated;
        Ok(())
    }

    /// `Authenticated → Active`: join the registry, replay the current
    /// layout to this connection, announce the new member count.
    pub async fn activate(&mut self) -> Result<(), crate::store::StoreError> {
        let Some(claims) = self.claims.as_ref() else {
            return Ok(());
        };
        if self.phase != Phase::Authenticated {
            return Ok(());
        }
        let user_id = claims.user_id.clone();
        let role = claims.role;

        self.engine
            .registry
            .join(&self.session_id, self.handle.clone())
            .await;

        // A failed replay must undo the join, or the registry keeps a ghost
        // member that close() will not clean up (it never went Active).
        let (version, document) = match self.engine.store.latest(&self.session_id).await {
            Ok(state) => state,
            Err(e) => {
                self.engine
                    .registry
                    .leave(&self.session_id, self.handle.id())
                    .await;
                return Err(e);
            }
        };
        let _ = self.handle.send(ServerMessage::Snapshot { version, document });

        let participant_count = self.engine.registry.count(&self.session_id).await;
        self.engine
            .registry
            .broadcast(&self.session_id, &ServerMessage::Presence { participant_count })
            .await;

        self.phase = Phase::Active;
        log::info!(
            "{user_id} joined session {} as {role} ({participant_count} participants)",
            self.session_id
        );
        Ok(())
    }

    /// Handle a raw inbound text frame. Malformed input gets a private
    /// `BAD_MESSAGE` error; the connection stays open.
    pub async fn handle_text(&mut self, raw: &str) {
        match ClientMessage::parse(raw) {
            Ok(msg) => self.handle(msg).await,
            Err(e) => {
                log::warn!(
                    "unparseable message on session {}: {e}",
                    self.session_id
                );
                let _ = self.handle.send(ServerMessage::error(
                    error_code::BAD_MESSAGE,
                    e.to_string(),
                ));
            }
        }
    }

    /// Handle a typed inbound message. Ignored unless `Active`.
    pub async fn handle(&mut self, msg: ClientMessage) {
        if self.phase != Phase::Active {
            return;
        }
        match msg {
            ClientMessage::Ping => {
                let _ = self.handle.send(ServerMessage::Pong);
            }
            ClientMessage::LayoutUpdate(update) => self.apply_update(update).await,
        }
    }

    async fn apply_update(&mut self, update: LayoutUpdate) {
        let Some(claims) = self.claims.as_ref() else {
            return;
        };
        let role = claims.role;
        let user_id = claims.user_id.clone();

        if !role.can_edit() {
            let _ = self.handle.send(ServerMessage::error(
                error_code::FORBIDDEN,
                "role cannot edit layout",
            ));
            return;
        }

        match self
            .engine
            .store
            .append(
                &self.session_id,
                update.base_version,
                update.document.clone(),
                &user_id,
            )
            .await
        {
            Ok(AppendOutcome::Committed(version)) => {
                self.engine
                    .registry
                    .broadcast(
                        &self.session_id,
                        &ServerMessage::Updated {
                            version,
                            document: update.document,
                            published_by: user_id,
                        },
                    )
                    .await;
            }
            Ok(AppendOutcome::Conflict) => {
                // Expected under concurrent editing, not an error. Hand the
                // proposer the authoritative state to rebase against; no
                // broadcast.
                log::debug!(
                    "stale publish from {user_id} on session {} (base {})",
                    self.session_id,
                    update.base_version
                );
                match self.engine.store.latest(&self.session_id).await {
                    Ok((version, document)) => {
                        let _ = self
                            .handle
                            .send(ServerMessage::Conflict { version, document });
                    }
                    Err(e) => {
                        log::error!(
                            "conflict re-fetch failed for session {}: {e}",
                            self.session_id
                        );
                        let _ = self.handle.send(ServerMessage::error(
                            error_code::INTERNAL,
                            "layout store unavailable",
                        ));
                    }
                }
            }
            Err(e) => {
                log::error!("layout append failed for session {}: {e}", self.session_id);
                let _ = self.handle.send(ServerMessage::error(
                    error_code::INTERNAL,
                    "layout store unavailable",
                ));
            }
        }
    }

    /// `* → Closed`: leave the registry and announce the decremented count.
    /// Idempotent — safe to call from every exit path, runs once.
    pub async fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        let was_active = self.phase == Phase::Active;
        self.phase = Phase::Closed;

        if !was_active {
            // Never joined; nothing to clean up
            return;
        }

        self.engine
            .registry
            .leave(&self.session_id, self.handle.id())
            .await;
        let participant_count = self.engine.registry.count(&self.session_id).await;
        self.engine
            .registry
            .broadcast(&self.session_id, &ServerMessage::Presence { participant_count })
            .await;

        if let Some(claims) = self.claims.as_ref() {
            log::info!(
                "{} left session {} ({participant_count} participants)",
                claims.user_id,
                self.session_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemorySessionDirectory;
    use crate::store::{default_layout, LayoutDocument, MemoryLayoutStore, StoreError};
    use crate::token::{Role, TokenConfig};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    /// Store wrapper whose failures can be switched on per operation.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryLayoutStore,
        fail_latest: AtomicBool,
        fail_append: AtomicBool,
    }

    impl FlakyStore {
        fn fail_latest(&self, on: bool) {
            self.fail_latest.store(on, Ordering::SeqCst);
        }

        fn fail_append(&self, on: bool) {
            self.fail_append.store(on, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl LayoutStore for FlakyStore {
        async fn latest(&self, session_id: &str) -> Result<(u64, LayoutDocument), StoreError> {
            if self.fail_latest.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("backend offline".to_string()));
            }
            self.inner.latest(session_id).await
        }

        async fn append(
            &self,
            session_id: &str,
            base_version: u64,
            document: LayoutDocument,
            published_by: &str,
        ) -> Result<AppendOutcome, StoreError> {
            if self.fail_append.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("backend offline".to_string()));
            }
            self.inner
                .append(session_id, base_version, document, published_by)
                .await
        }
    }

    struct Fixture {
        engine: Arc<CollabEngine>,
        store: Arc<MemoryLayoutStore>,
        directory: Arc<MemorySessionDirectory>,
    }

    fn fixture() -> Fixture {
        fixture_with_ttl(DEFAULT_TEST_TTL)
    }

    const DEFAULT_TEST_TTL: i64 = 900;

    fn fixture_with_ttl(ttl: i64) -> Fixture {
        let tokens = Arc::new(
            TokenService::new(TokenConfig::for_testing().ttl_seconds(ttl)).unwrap(),
        );
        let registry = Arc::new(SessionRegistry::new());
        let store = Arc::new(MemoryLayoutStore::new());
        let directory = Arc::new(MemorySessionDirectory::new());
        let engine = Arc::new(CollabEngine::new(
            tokens,
            registry,
            store.clone(),
            directory.clone(),
        ));
        Fixture {
            engine,
            store,
            directory,
        }
    }

    async fn member_token(fx: &Fixture, session: &str, user: &str, role: Role) -> String {
        fx.directory.grant(session, user).await;
        fx.engine.tokens().mint(session, user, role).unwrap().token
    }

    /// Authenticate + activate a member connection, returning it with its
    /// outbound receiver (snapshot already consumed).
    async fn active_member(
        fx: &Fixture,
        session: &str,
        user: &str,
        role: Role,
    ) -> (SessionConnection, mpsc::Receiver<ServerMessage>) {
        let token = member_token(fx, session, user, role).await;
        let (handle, mut rx) = ConnectionHandle::new(32);
        let mut conn = fx.engine.open(session, handle);
        conn.authenticate(&token).await.unwrap();
        conn.activate().await.unwrap();

        // Drain the snapshot so callers start from a clean queue
        match rx.recv().await {
            Some(ServerMessage::Snapshot { .. }) => {}
            other => panic!("expected snapshot first, got {other:?}"),
        }
        (conn, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_invalid_token_rejected_without_registry_mutation() {
        let fx = fixture();
        let (handle, _rx) = ConnectionHandle::new(8);
        let mut conn = fx.engine.open("s1", handle);

        let rejection = conn.authenticate("garbage").await.unwrap_err();
        assert_eq!(rejection.reason, CloseReason::InvalidToken);
        assert_eq!(conn.phase(), Phase::Connecting);
        assert!(!fx.engine.registry().is_tracked("s1").await);
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let fx = fixture_with_ttl(-5);
        let token = member_token(&fx, "s1", "alice", Role::Editor).await;
        let (handle, _rx) = ConnectionHandle::new(8);
        let mut conn = fx.engine.open("s1", handle);

        let rejection = conn.authenticate(&token).await.unwrap_err();
        assert_eq!(rejection.reason, CloseReason::InvalidToken);
    }

    #[tokio::test]
    async fn test_session_mismatch_rejected() {
        let fx = fixture();
        // Valid token for s1, member of both sessions — the token scope wins
        fx.directory.grant("s1", "alice").await;
        fx.directory.grant("s2", "alice").await;
        let token = fx.engine.tokens().mint("s1", "alice", Role::Editor).unwrap().token;

        let (handle, _rx) = ConnectionHandle::new(8);
        let mut conn = fx.engine.open("s2", handle);
        let rejection = conn.authenticate(&token).await.unwrap_err();
        assert_eq!(rejection.reason, CloseReason::SessionMismatch);
    }

    #[tokio::test]
    async fn test_non_member_rejected() {
        let fx = fixture();
        let token = fx.engine.tokens().mint("s1", "mallory", Role::Editor).unwrap().token;

        let (handle, _rx) = ConnectionHandle::new(8);
        let mut conn = fx.engine.open("s1", handle);
        let rejection = conn.authenticate(&token).await.unwrap_err();
        assert_eq!(rejection.reason, CloseReason::NotAMember);
        assert!(!fx.engine.registry().is_tracked("s1").await);
    }

    #[tokio::test]
    async fn test_bearer_token_admits_member() {
        let fx = fixture();
        fx.directory.grant("s1", "alice").await;
        let token = fx.engine.tokens().mint_bearer("alice", Role::Editor).unwrap().token;

        let (handle, _rx) = ConnectionHandle::new(8);
        let mut conn = fx.engine.open("s1", handle);
        conn.authenticate(&token).await.unwrap();
        assert_eq!(conn.phase(), Phase::Authenticated);
    }

    #[tokio::test]
    async fn test_bearer_token_still_needs_membership() {
        let fx = fixture();
        let token = fx.engine.tokens().mint_bearer("alice", Role::Editor).unwrap().token;

        let (handle, _rx) = ConnectionHandle::new(8);
        let mut conn = fx.engine.open("s1", handle);
        let rejection = conn.authenticate(&token).await.unwrap_err();
        assert_eq!(rejection.reason, CloseReason::NotAMember);
    }

    #[tokio::test]
    async fn test_activation_sends_snapshot_and_presence() {
        let fx = fixture();
        let token = member_token(&fx, "s1", "alice", Role::Editor).await;
        let (handle, mut rx) = ConnectionHandle::new(8);
        let mut conn = fx.engine.open("s1", handle);

        conn.authenticate(&token).await.unwrap();
        conn.activate().await.unwrap();
        assert_eq!(conn.phase(), Phase::Active);

        assert_eq!(
            rx.recv().await,
            Some(ServerMessage::Snapshot {
                version: 0,
                document: default_layout(),
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(ServerMessage::Presence {
                participant_count: 1
            })
        );
    }

    #[tokio::test]
    async fn test_editor_publish_broadcasts_to_all_including_proposer() {
        let fx = fixture();
        let (mut alice, mut alice_rx) = active_member(&fx, "s1", "alice", Role::Editor).await;
        let (_bob, mut bob_rx) = active_member(&fx, "s1", "bob", Role::Observer).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let d1 = json!({"panels": [{"id": "p1", "streamId": "cam-a"}]});
        alice
            .handle(ClientMessage::LayoutUpdate(LayoutUpdate {
                base_version: 0,
                document: d1.clone(),
            }))
            .await;

        let expected = ServerMessage::Updated {
            version: 1,
            document: d1,
            published_by: "alice".to_string(),
        };
        assert_eq!(alice_rx.recv().await, Some(expected.clone()));
        assert_eq!(bob_rx.recv().await, Some(expected));
    }

    #[tokio::test]
    async fn test_stale_publish_gets_private_conflict() {
        let fx = fixture();
        let (mut alice, mut alice_rx) = active_member(&fx, "s1", "alice", Role::Editor).await;
        let (mut bob, mut bob_rx) = active_member(&fx, "s1", "bob", Role::Editor).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let d1 = json!({"winner": true});
        alice
            .handle(ClientMessage::LayoutUpdate(LayoutUpdate {
                base_version: 0,
                document: d1.clone(),
            }))
            .await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        // Bob proposes from the same stale base
        bob.handle(ClientMessage::LayoutUpdate(LayoutUpdate {
            base_version: 0,
            document: json!({"winner": false}),
        }))
        .await;

        // Bob alone gets the authoritative state back
        assert_eq!(
            bob_rx.recv().await,
            Some(ServerMessage::Conflict {
                version: 1,
                document: d1,
            })
        );
        assert!(alice_rx.try_recv().is_err(), "no broadcast from a conflict");

        // And the store kept only the winner
        assert_eq!(fx.store.history("s1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_observer_publish_is_forbidden_privately() {
        let fx = fixture();
        let (_alice, mut alice_rx) = active_member(&fx, "s1", "alice", Role::Editor).await;
        let (mut eve, mut eve_rx) = active_member(&fx, "s1", "eve", Role::Observer).await;
        drain(&mut alice_rx);
        drain(&mut eve_rx);

        eve.handle(ClientMessage::LayoutUpdate(LayoutUpdate {
            base_version: 0,
            document: json!({}),
        }))
        .await;

        match eve_rx.recv().await {
            Some(ServerMessage::Error { code, .. }) => {
                assert_eq!(code, error_code::FORBIDDEN)
            }
            other => panic!("expected forbidden error, got {other:?}"),
        }
        assert!(alice_rx.try_recv().is_err());
        assert!(fx.store.history("s1").await.is_empty(), "no store mutation");

        // The offending connection stays open
        assert_eq!(eve.phase(), Phase::Active);
    }

    #[tokio::test]
    async fn test_admin_can_publish() {
        let fx = fixture();
        let (mut root, mut rx) = active_member(&fx, "s1", "root", Role::Admin).await;
        drain(&mut rx);

        root.handle(ClientMessage::LayoutUpdate(LayoutUpdate {
            base_version: 0,
            document: json!({}),
        }))
        .await;
        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::Updated { version: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let fx = fixture();
        let (mut conn, mut rx) = active_member(&fx, "s1", "alice", Role::Observer).await;
        drain(&mut rx);

        conn.handle(ClientMessage::Ping).await;
        assert_eq!(rx.recv().await, Some(ServerMessage::Pong));
    }

    #[tokio::test]
    async fn test_malformed_input_is_not_fatal() {
        let fx = fixture();
        let (mut conn, mut rx) = active_member(&fx, "s1", "alice", Role::Editor).await;
        drain(&mut rx);

        conn.handle_text("{{{ not json").await;
        match rx.recv().await {
            Some(ServerMessage::Error { code, .. }) => {
                assert_eq!(code, error_code::BAD_MESSAGE)
            }
            other => panic!("expected bad-message error, got {other:?}"),
        }
        assert_eq!(conn.phase(), Phase::Active);

        // The connection still works afterwards
        conn.handle(ClientMessage::Ping).await;
        assert_eq!(rx.recv().await, Some(ServerMessage::Pong));
    }

    #[tokio::test]
    async fn test_unknown_message_type_reports_bad_message() {
        let fx = fixture();
        let (mut conn, mut rx) = active_member(&fx, "s1", "alice", Role::Editor).await;
        drain(&mut rx);

        conn.handle_text(r#"{"type":"media.play","payload":{}}"#).await;
        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::Error { .. })
        ));
        assert_eq!(conn.phase(), Phase::Active);
    }

    #[tokio::test]
    async fn test_close_leaves_and_announces_presence() {
        let fx = fixture();
        let (mut alice, _alice_rx) = active_member(&fx, "s1", "alice", Role::Editor).await;
        let (_bob, mut bob_rx) = active_member(&fx, "s1", "bob", Role::Observer).await;
        drain(&mut bob_rx);

        alice.close().await;
        assert_eq!(alice.phase(), Phase::Closed);
        assert_eq!(fx.engine.registry().count("s1").await, 1);
        assert_eq!(
            bob_rx.recv().await,
            Some(ServerMessage::Presence {
                participant_count: 1
            })
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let fx = fixture();
        let (mut alice, _alice_rx) = active_member(&fx, "s1", "alice", Role::Editor).await;
        let (_bob, mut bob_rx) = active_member(&fx, "s1", "bob", Role::Observer).await;
        drain(&mut bob_rx);

        alice.close().await;
        alice.close().await;
        alice.close().await;

        // Exactly one presence announcement from the teardown
        let presence: Vec<_> = drain(&mut bob_rx)
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::Presence { .. }))
            .collect();
        assert_eq!(presence.len(), 1);
    }

    #[tokio::test]
    async fn test_close_before_activation_touches_nothing() {
        let fx = fixture();
        let token = member_token(&fx, "s1", "alice", Role::Editor).await;
        let (handle, _rx) = ConnectionHandle::new(8);
        let mut conn = fx.engine.open("s1", handle);
        conn.authenticate(&token).await.unwrap();

        conn.close().await;
        assert_eq!(conn.phase(), Phase::Closed);
        assert!(!fx.engine.registry().is_tracked("s1").await);
    }

    #[tokio::test]
    async fn test_last_close_drops_session_entry() {
        let fx = fixture();
        let (mut conn, _rx) = active_member(&fx, "s1", "alice", Role::Editor).await;
        assert!(fx.engine.registry().is_tracked("s1").await);

        conn.close().await;
        assert!(!fx.engine.registry().is_tracked("s1").await);
    }

    #[tokio::test]
    async fn test_messages_before_activation_are_ignored() {
        let fx = fixture();
        let token = member_token(&fx, "s1", "alice", Role::Editor).await;
        let (handle, mut rx) = ConnectionHandle::new(8);
        let mut conn = fx.engine.open("s1", handle);
        conn.authenticate(&token).await.unwrap();

        conn.handle(ClientMessage::Ping).await;
        assert!(rx.try_recv().is_err());
    }

    struct FlakyFixture {
        engine: Arc<CollabEngine>,
        store: Arc<FlakyStore>,
        directory: Arc<MemorySessionDirectory>,
    }

    fn flaky_fixture() -> FlakyFixture {
        let tokens = Arc::new(TokenService::new(TokenConfig::for_testing()).unwrap());
        let registry = Arc::new(SessionRegistry::new());
        let store = Arc::new(FlakyStore::default());
        let directory = Arc::new(MemorySessionDirectory::new());
        let engine = Arc::new(CollabEngine::new(
            tokens,
            registry,
            store.clone(),
            directory.clone(),
        ));
        FlakyFixture {
            engine,
            store,
            directory,
        }
    }

    impl FlakyFixture {
        async fn member_token(&self, session: &str, user: &str, role: Role) -> String {
            self.directory.grant(session, user).await;
            self.engine.tokens().mint(session, user, role).unwrap().token
        }
    }

    #[tokio::test]
    async fn test_failed_activation_leaves_no_ghost_member() {
        let fx = flaky_fixture();
        fx.store.fail_latest(true);
        let token = fx.member_token("s1", "alice", Role::Editor).await;
        let (handle, _rx) = ConnectionHandle::new(8);
        let mut conn = fx.engine.open("s1", handle);
        conn.authenticate(&token).await.unwrap();

        assert!(conn.activate().await.is_err());

        // The failed replay must have undone the join
        assert_eq!(fx.engine.registry().count("s1").await, 0);
        assert!(!fx.engine.registry().is_tracked("s1").await);

        // The transport-side teardown still runs cleanly afterwards
        conn.close().await;
        assert_eq!(conn.phase(), Phase::Closed);
        assert!(!fx.engine.registry().is_tracked("s1").await);
    }

    #[tokio::test]
    async fn test_failed_activation_does_not_strand_other_members() {
        let fx = flaky_fixture();
        let alice_token = fx.member_token("s1", "alice", Role::Editor).await;
        let (alice_handle, mut alice_rx) = ConnectionHandle::new(32);
        let mut alice = fx.engine.open("s1", alice_handle);
        alice.authenticate(&alice_token).await.unwrap();
        alice.activate().await.unwrap();
        drain(&mut alice_rx);

        fx.store.fail_latest(true);
        let bob_token = fx.member_token("s1", "bob", Role::Observer).await;
        let (bob_handle, _bob_rx) = ConnectionHandle::new(8);
        let mut bob = fx.engine.open("s1", bob_handle);
        bob.authenticate(&bob_token).await.unwrap();
        assert!(bob.activate().await.is_err());

        // Only Alice remains; future broadcasts see the true membership
        assert_eq!(fx.engine.registry().count("s1").await, 1);
        fx.store.fail_latest(false);

        fx.engine
            .registry()
            .broadcast("s1", &ServerMessage::Pong)
            .await;
        assert_eq!(drain(&mut alice_rx), vec![ServerMessage::Pong]);
    }

    #[tokio::test]
    async fn test_append_failure_reports_internal_privately() {
        let fx = flaky_fixture();
        let alice_token = fx.member_token("s1", "alice", Role::Editor).await;
        let (alice_handle, mut alice_rx) = ConnectionHandle::new(32);
        let mut alice = fx.engine.open("s1", alice_handle);
        alice.authenticate(&alice_token).await.unwrap();
        alice.activate().await.unwrap();

        let bob_token = fx.member_token("s1", "bob", Role::Observer).await;
        let (bob_handle, mut bob_rx) = ConnectionHandle::new(32);
        let mut bob = fx.engine.open("s1", bob_handle);
        bob.authenticate(&bob_token).await.unwrap();
        bob.activate().await.unwrap();
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        fx.store.fail_append(true);
        alice
            .handle(ClientMessage::LayoutUpdate(LayoutUpdate {
                base_version: 0,
                document: json!({}),
            }))
            .await;

        match alice_rx.recv().await {
            Some(ServerMessage::Error { code, .. }) => {
                assert_eq!(code, error_code::INTERNAL)
            }
            other => panic!("expected internal error, got {other:?}"),
        }
        // Nothing fanned out, connection still Active
        assert!(bob_rx.try_recv().is_err());
        assert_eq!(alice.phase(), Phase::Active);
    }

    #[tokio::test]
    async fn test_conflict_refetch_failure_reports_internal() {
        let fx = flaky_fixture();
        let token = fx.member_token("s1", "alice", Role::Editor).await;
        let (handle, mut rx) = ConnectionHandle::new(32);
        let mut conn = fx.engine.open("s1", handle);
        conn.authenticate(&token).await.unwrap();
        conn.activate().await.unwrap();
        drain(&mut rx);

        // Land version 1, then make the authoritative re-fetch fail
        conn.handle(ClientMessage::LayoutUpdate(LayoutUpdate {
            base_version: 0,
            document: json!({}),
        }))
        .await;
        drain(&mut rx);
        fx.store.fail_latest(true);

        conn.handle(ClientMessage::LayoutUpdate(LayoutUpdate {
            base_version: 0,
            document: json!({}),
        }))
        .await;

        match rx.recv().await {
            Some(ServerMessage::Error { code, .. }) => {
                assert_eq!(code, error_code::INTERNAL)
            }
            other => panic!("expected internal error, got {other:?}"),
        }
        assert_eq!(conn.phase(), Phase::Active);
    }
}
