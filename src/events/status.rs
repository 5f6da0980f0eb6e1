use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one agent.
///
/// ```text
/// STARTING ─► RUNNING ─► STOPPING ─► DONE
///    │           └─► WAITING ─► STARTING   (process exited, restart scheduled)
///    └─► INITIALIZATION_ERROR ─► DONE
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Starting,
    InitializationError,
    Running,
    Waiting,
    Stopping,
    Done,
}

impl AgentStatus {
    /// Terminal status: the handle has fully exited.
    #[inline]
    pub fn is_done(&self) -> bool {
        matches!(self, AgentStatus::Done)
    }

    /// Stable wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Starting => "STARTING",
            AgentStatus::InitializationError => "INITIALIZATION_ERROR",
            AgentStatus::Running => "RUNNING",
            AgentStatus::Waiting => "WAITING",
            AgentStatus::Stopping => "STOPPING",
            AgentStatus::Done => "DONE",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
