//! # Running-agent registry.
//!
//! Owns one entry per live handle. Entries are created when the supervisor
//! starts an agent and removed only after the entry's forwarder finished,
//! i.e. after the handle fully exited and its status channel was drained.
//!
//! ## Rules
//! - Process and built-in IDs are disjoint by construction.
//! - A process entry's `listen_port` stays reserved for the entry's lifetime.
//! - `changes`/`qan` are `None` once the supervisor shut down; dropping them
//!   (together with the forwarders' clones) closes the output channels.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::agents::{AgentType, BuiltinParams, LogStore, ProcessParams};
use crate::events::{QanRequest, StateChangedEvent};

/// Cancellation and completion of one handle.
pub(crate) struct Handle {
    pub cancel: CancellationToken,
    /// Forwarder task; finishes after the handle's status channel closed.
    pub done: JoinHandle<()>,
}

impl Handle {
    /// Cancels the handle and waits until its forwarder exits.
    pub async fn stop(&mut self, agent_id: &str) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.done).await {
            warn!(agent_id, error = %e, "agent forwarder panicked");
        }
    }
}

/// Live process agent.
pub(crate) struct ProcessEntry {
    pub handle: Handle,
    /// Raw params as last applied, compared before template rendering.
    pub params: ProcessParams,
    pub listen_port: u16,
    pub exec_path: String,
    pub logs: Arc<LogStore>,
}

impl PartialEq<ProcessParams> for ProcessEntry {
    fn eq(&self, other: &ProcessParams) -> bool {
        self.params == *other
    }
}

/// Live built-in agent.
pub(crate) struct BuiltinEntry {
    pub handle: Handle,
    pub params: BuiltinParams,
    pub logs: Arc<LogStore>,
}

impl BuiltinEntry {
    pub fn agent_type(&self) -> AgentType {
        self.params.agent_type
    }
}

impl PartialEq<BuiltinParams> for BuiltinEntry {
    fn eq(&self, other: &BuiltinParams) -> bool {
        self.params == *other
    }
}

/// State guarded by the supervisor's lock.
pub(crate) struct Running {
    pub processes: HashMap<String, ProcessEntry>,
    pub builtins: HashMap<String, BuiltinEntry>,
    pub changes: Option<mpsc::Sender<StateChangedEvent>>,
    pub qan: Option<mpsc::Sender<QanRequest>>,
}

impl Running {
    pub fn new(
        changes: mpsc::Sender<StateChangedEvent>,
        qan: mpsc::Sender<QanRequest>,
    ) -> Self {
        Self {
            processes: HashMap::new(),
            builtins: HashMap::new(),
            changes: Some(changes),
            qan: Some(qan),
        }
    }

    /// Returns true once the output channels were released.
    pub fn is_closed(&self) -> bool {
        self.changes.is_none()
    }
}
