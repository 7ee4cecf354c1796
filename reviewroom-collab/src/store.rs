//! Layout store adapter: the narrow slice of persistence the collab core needs.
//!
//! The engine never caches layout state. Every conflict re-fetches the
//! authoritative version through [`LayoutStore::latest`], and every publish
//! goes through the atomic check-and-append of [`LayoutStore::append`]:
//!
//! ```text
//! append(session, base, doc)          latest version == base?
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐   per-session lock  ┌─────────────┐
//! │ LayoutStore  │ ──────────────────► │ yes: commit │──► Committed(base+1)
//! │ (adapter)    │                     │ no:  refuse │──► Conflict
//! └──────────────┘                     └─────────────┘
//! ```
//!
//! Real deployments back this trait with a database; [`MemoryLayoutStore`]
//! is the reference implementation and the test double.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Opaque layout document: a tree of panel assignments.
pub type LayoutDocument = serde_json::Value;

/// The implicit document at version 0, before anything has been published.
///
/// Four empty panels, matching the default review-room grid.
pub fn default_layout() -> LayoutDocument {
    serde_json::json!({
        "panels": [
            { "id": "p1", "streamId": null },
            { "id": "p2", "streamId": null },
            { "id": "p3", "streamId": null },
            { "id": "p4", "streamId": null },
        ]
    })
}

/// One published layout version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LayoutRecord {
    /// Version number, starting at 1 for the first publish.
    pub version: u64,
    pub document: LayoutDocument,
    /// User id of the publisher.
    pub published_by: String,
}

/// Result of an append attempt.
///
/// `Conflict` is an expected outcome, not an error: the caller's base
/// version went stale and the client must rebase against `latest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The document was durably stored at this new version.
    Committed(u64),
    /// The declared base version no longer matches the latest; nothing written.
    Conflict,
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// The backing store failed (I/O, connection, transaction abort).
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Backend(e) => write!(f, "layout store backend error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// What the collab core requires from persistence.
///
/// `append` must be atomic per session: two concurrent calls with the same
/// stale base version must produce exactly one `Committed` and one
/// `Conflict`.
#[async_trait]
pub trait LayoutStore: Send + Sync {
    /// Latest published version and document; `(0, default_layout())` if
    /// nothing has been published for the session yet.
    async fn latest(&self, session_id: &str) -> Result<(u64, LayoutDocument), StoreError>;

    /// Check-and-append: stores `document` at `base_version + 1` iff
    /// `base_version` is still the latest.
    async fn append(
        &self,
        session_id: &str,
        base_version: u64,
        document: LayoutDocument,
        published_by: &str,
    ) -> Result<AppendOutcome, StoreError>;
}

/// In-memory layout store.
///
/// Per-session history behind a per-session mutex — the mutex is the
/// serialization point that makes check-and-append atomic, and sessions
/// never contend with each other.
#[derive(Default)]
pub struct MemoryLayoutStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<Vec<LayoutRecord>>>>>,
}

impl MemoryLayoutStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full version history for a session (diagnostics and tests).
    pub async fn history(&self, session_id: &str) -> Vec<LayoutRecord> {
        let entry = {
            let sessions = self.sessions.read().await;
            sessions.get(session_id).cloned()
        };
        match entry {
            Some(records) => records.lock().await.clone(),
            None => Vec::new(),
        }
    }

    /// Number of sessions with a stored entry (diagnostic — lets tests
    /// verify refused appends never create placeholder entries).
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn entry(&self, session_id: &str) -> Arc<Mutex<Vec<LayoutRecord>>> {
        // Fast path: read lock
        {
            let sessions = self.sessions.read().await;
            if let Some(records) = sessions.get(session_id) {
                return records.clone();
            }
        }

        // Slow path: write lock, double-check after acquiring
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }
}

#[async_trait]
impl LayoutStore for MemoryLayoutStore {
    async fn latest(&self, session_id: &str) -> Result<(u64, LayoutDocument), StoreError> {
        let entry = {
            let sessions = self.sessions.read().await;
            sessions.get(session_id).cloned()
        };
        let Some(records) = entry else {
            return Ok((0, default_layout()));
        };
        let records = records.lock().await;
        match records.last() {
            Some(record) => Ok((record.version, record.document.clone())),
            None => Ok((0, default_layout())),
        }
    }

    async fn append(
        &self,
        session_id: &str,
        base_version: u64,
        document: LayoutDocument,
        published_by: &str,
    ) -> Result<AppendOutcome, StoreError> {
        let entry = {
            let sessions = self.sessions.read().await;
            sessions.get(session_id).cloned()
        };
        // A publish that cannot possibly commit must not materialize an
        // entry for a session that has never published anything
        let entry = match entry {
            Some(entry) => entry,
            None if base_version == 0 => self.entry(session_id).await,
            None => return Ok(AppendOutcome::Conflict),
        };
        let mut records = entry.lock().await;
        let current = records.last().map_or(0, |r| r.version);
        if base_version != current {
            return Ok(AppendOutcome::Conflict);
        }
        let version = current + 1;
        records.push(LayoutRecord {
            version,
            document,
            published_by: published_by.to_string(),
        });
        Ok(AppendOutcome::Committed(version))
    }
}
