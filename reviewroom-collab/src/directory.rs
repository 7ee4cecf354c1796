//! Session membership directory — an external collaborator seam.
//!
//! Token validity alone never grants access: a connection is admitted only
//! if the directory confirms the user belongs to the session. Production
//! deployments back this with the session service's participant table;
//! [`MemorySessionDirectory`] serves tests and demos.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Answers "is this user allowed in this session at all".
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn is_member(&self, session_id: &str, user_id: &str) -> bool;
}

/// In-memory membership directory.
#[derive(Default)]
pub struct MemorySessionDirectory {
    members: RwLock<HashMap<String, HashSet<String>>>,
}

impl MemorySessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn grant(&self, session_id: &str, user_id: &str) {
        let mut members = self.members.write().await;
        members
            .entry(session_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    pub async fn revoke(&self, session_id: &str, user_id: &str) {
        let mut members = self.members.write().await;
        if let Some(set) = members.get_mut(session_id) {
            set.remove(user_id);
            if set.is_empty() {
                members.remove(session_id);
            }
        }
    }
}

#[async_trait]
impl SessionDirectory for MemorySessionDirectory {
    async fn is_member(&self, session_id: &str, user_id: &str) -> bool {
        let members = self.members.read().await;
        members
            .get(session_id)
            .is_some_and(|set| set.contains(user_id))
    }
}
