//! Concurrent connection registry with per-session fan-out.
//!
//! ```text
//! session A ── Room ── { conn1, conn2, conn3 }
//! session B ── Room ── { conn4 }
//! ```
//!
//! Each session gets its own `Room` behind its own mutex, so operations on
//! different sessions never contend. Broadcast snapshots the member list
//! under the room lock and sends outside it: connections that join after
//! the snapshot do not receive that broadcast, and a single broadcast does
//! O(current membership) work.
//!
//! The registry holds non-owning handles. Dropping a session's last member
//! removes the session entry entirely — memory stays bounded by active
//! sessions, never by historical ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Non-owning outbound handle for one live connection.
///
/// The transport task owns the receiving half and drains it into the
/// socket; everything else (registry fan-out, private engine replies) goes
/// through cloned handles.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::Sender<ServerMessage>,
}

/// Outcome of a single non-blocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Outbound queue full; message dropped for this peer only.
    Dropped,
    /// Receiving half is gone; the connection is dead.
    Dead,
}

impl ConnectionHandle {
    /// Create a handle plus the receiver its transport task will drain.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Fire-and-forget send. Never blocks: a slow peer drops the message,
    /// a dead peer reports `Dead` so the caller can prune it.
    pub fn send(&self, msg: ServerMessage) -> SendOutcome {
        match self.tx.try_send(msg) {
            Ok(()) => SendOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Dead,
        }
    }
}

/// Membership set for one session.
#[derive(Default)]
struct Room {
    members: HashMap<Uuid, ConnectionHandle>,
    /// Set when the room is dropped from the outer map; a racing `join`
    /// that still holds the old Arc must re-resolve instead of inserting
    /// into an orphan.
    defunct: bool,
}

/// Registry statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub broadcasts: u64,
    pub messages_dropped: u64,
    pub active_sessions: usize,
}

/// Lock-free counters — broadcast never takes a lock for stats.
#[derive(Default)]
struct AtomicRegistryStats {
    broadcasts: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Tracks which live connections belong to which session.
///
/// All operations are `&self` and safe under unbounded concurrent callers.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
    stats: AtomicRegistryStats,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a session's membership set. Idempotent for the
    /// same connection id.
    pub async fn join(&self, session_id: &str, handle: ConnectionHandle) {
        loop {
            let room = self.room_or_create(session_id).await;
            let mut guard = room.lock().await;
            if guard.defunct {
                // Raced with the last leave; the entry was dropped. Retry
                // against a fresh room.
                continue;
            }
            guard.members.insert(handle.id(), handle);
            return;
        }
    }

    /// Remove a connection. Returns whether it was a member. When the last
    /// member leaves, the session entry itself is dropped.
    pub async fn leave(&self, session_id: &str, conn_id: Uuid) -> bool {
        let room = {
            let sessions = self.sessions.read().await;
            sessions.get(session_id).cloned()
        };
        let Some(room) = room else {
            return false;
        };

        let (removed, emptied) = {
            let mut guard = room.lock().await;
            let removed = guard.members.remove(&conn_id).is_some();
            (removed, removed && guard.members.is_empty() && !guard.defunct)
        };

        if emptied {
            let mut sessions = self.sessions.write().await;
            // Re-check under the outer write lock: a join may have landed
            // in the meantime, or the entry may already have been swapped.
            if let Some(current) = sessions.get(session_id) {
                if Arc::ptr_eq(current, &room) {
                    let mut guard = room.lock().await;
                    if guard.members.is_empty() {
                        guard.defunct = true;
                        drop(guard);
                        sessions.remove(session_id);
                        log::debug!("session {session_id} has no members, entry dropped");
                    }
                }
            }
        }
        removed
    }

    /// Deliver `msg` to every current member of the session.
    ///
    /// Recipients are snapshotted once at the start of the call. Dead peers
    /// are pruned from the registry; a full outbound queue drops the
    /// message for that peer only. Returns the delivered count.
    pub async fn broadcast(&self, session_id: &str, msg: &ServerMessage) -> usize {
        let recipients: Vec<ConnectionHandle> = {
            let room = {
                let sessions = self.sessions.read().await;
                sessions.get(session_id).cloned()
            };
            match room {
                Some(room) => room.lock().await.members.values().cloned().collect(),
                None => return 0,
            }
        };

        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        let mut dead = Vec::new();
        for handle in &recipients {
            match handle.send(msg.clone()) {
                SendOutcome::Delivered => delivered += 1,
                SendOutcome::Dropped => {
                    self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "dropping broadcast for lagging connection {} in session {session_id}",
                        handle.id()
                    );
                }
                SendOutcome::Dead => dead.push(handle.id()),
            }
        }

        // Self-healing: prune connections whose receiver is gone
        for conn_id in dead {
            log::debug!("pruning dead connection {conn_id} from session {session_id}");
            self.leave(session_id, conn_id).await;
        }

        delivered
    }

    /// Current membership size; 0 for unknown sessions.
    pub async fn count(&self, session_id: &str) -> usize {
        let room = {
            let sessions = self.sessions.read().await;
            sessions.get(session_id).cloned()
        };
        match room {
            Some(room) => room.lock().await.members.len(),
            None => 0,
        }
    }

    /// Whether the session has a live entry at all (diagnostic — lets tests
    /// verify empty entries are dropped, not kept as placeholders).
    pub async fn is_tracked(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Number of sessions with at least one member.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            broadcasts: self.stats.broadcasts.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_sessions: self.sessions.read().await.len(),
        }
    }

    async fn room_or_create(&self, session_id: &str) -> Arc<Mutex<Room>> {
        // Fast path: read lock
        {
            let sessions = self.sessions.read().await;
            if let Some(room) = sessions.get(session_id) {
                return room.clone();
            }
        }

        // Slow path: write lock, double-check after acquiring
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Room::default())))
            .clone()
    }
}
