//! # Last known status per agent.
//!
//! Mirrors the forwarders' view of each agent so listings can be served
//! without touching the handles.
//!
//! ## Rules
//! - Every status reported by a handle is stored, in arrival order.
//! - DONE removes the entry: an absent ID means "not tracked", not "unknown".

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::events::AgentStatus;

/// Thread-safe map of agent ID → last status.
#[derive(Debug, Default)]
pub struct StatusTracker {
    state: RwLock<HashMap<String, AgentStatus>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `status` for `agent_id`, evicting the entry on DONE.
    pub async fn store(&self, agent_id: &str, status: AgentStatus) {
        let mut state = self.state.write().await;
        if status.is_done() {
            state.remove(agent_id);
        } else {
            state.insert(agent_id.to_string(), status);
        }
    }

    /// Returns the last status of `agent_id`, if tracked.
    pub async fn get(&self, agent_id: &str) -> Option<AgentStatus> {
        self.state.read().await.get(agent_id).copied()
    }

    /// Returns the number of tracked agents.
    pub async fn len(&self) -> usize {
        self.state.read().await.len()
    }
}
