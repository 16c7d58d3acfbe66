//! Session tool gate: the in-memory map a tool dispatcher consults to deny
//! operations a lead session has not yet approved for a given session key.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct SessionToolGate {
    approved: Arc<RwLock<HashMap<String, HashSet<String>>>>,
}

impl SessionToolGate {
    pub fn new() -> Self {
        SessionToolGate::default()
    }

    /// Ensures `session_key` has an entry (initially empty: every tool gated).
    pub async fn gate_session_tools(&self, session_key: &str) {
        self.approved.write().await.entry(session_key.to_string()).or_default();
    }

    pub async fn approve_session_tools(&self, session_key: &str, tools: impl IntoIterator<Item = String>) {
        let mut approved = self.approved.write().await;
        approved.entry(session_key.to_string()).or_default().extend(tools);
    }

    pub async fn revoke_session_tools(&self, session_key: &str, tools: &[String]) {
        let mut approved = self.approved.write().await;
        if let Some(set) = approved.get_mut(session_key) {
            for tool in tools {
                set.remove(tool);
            }
        }
    }

    /// `true` when `tool_name` is gated (i.e. NOT approved) for this session
    /// key. A session key with no gate entry at all is ungated (not tracked).
    pub async fn is_tool_gated(&self, session_key: &str, tool_name: &str) -> bool {
        match self.approved.read().await.get(session_key) {
            Some(approved) => !approved.contains(tool_name),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn untracked_session_is_ungated() {
        let gate = SessionToolGate::new();
        assert!(!gate.is_tool_gated("session-a", "bash").await);
    }

    #[tokio::test]
    async fn gating_denies_until_approved() {
        let gate = SessionToolGate::new();
        gate.gate_session_tools("session-a").await;
        assert!(gate.is_tool_gated("session-a", "bash").await);

        gate.approve_session_tools("session-a", ["bash".to_string()]).await;
        assert!(!gate.is_tool_gated("session-a", "bash").await);
        assert!(gate.is_tool_gated("session-a", "edit").await);
    }

    #[tokio::test]
    async fn revoke_regates_a_previously_approved_tool() {
        let gate = SessionToolGate::new();
        gate.gate_session_tools("session-a").await;
        gate.approve_session_tools("session-a", ["bash".to_string()]).await;
        gate.revoke_session_tools("session-a", &["bash".to_string()]).await;
        assert!(gate.is_tool_gated("session-a", "bash").await);
    }
}
