//! # Messages published by the supervisor.
//!
//! All types are plain data with serde derives; encoding them for the wire is
//! the transport layer's concern.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::status::AgentStatus;
use crate::agents::AgentType;

/// One status transition of one agent.
///
/// `listen_port` and `process_exec_path` are set for process agents only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangedEvent {
    pub agent_id: String,
    pub status: AgentStatus,
    pub listen_port: Option<u16>,
    pub process_exec_path: Option<String>,
}

impl StateChangedEvent {
    /// Event for a built-in agent.
    pub fn builtin(agent_id: impl Into<String>, status: AgentStatus) -> Self {
        Self {
            agent_id: agent_id.into(),
            status,
            listen_port: None,
            process_exec_path: None,
        }
    }

    /// Event for a process agent.
    pub fn process(
        agent_id: impl Into<String>,
        status: AgentStatus,
        listen_port: u16,
        exec_path: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            status,
            listen_port: Some(listen_port),
            process_exec_path: Some(exec_path.into()),
        }
    }
}

/// Aggregated query statistics for one query over one period.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsBucket {
    pub agent_id: String,
    pub query_id: String,
    pub fingerprint: String,
    pub period_start: SystemTime,
    pub period_length_secs: u32,
    pub num_queries: f32,
    pub query_time_sum: f32,
}

/// One batch of QAN buckets to forward upstream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QanRequest {
    pub metrics_bucket: Vec<MetricsBucket>,
}

/// What a built-in agent reports through its changes channel.
///
/// Either part may be absent: collectors emit bucket-only changes between
/// status transitions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AgentChange {
    pub status: Option<AgentStatus>,
    pub metrics_bucket: Option<Vec<MetricsBucket>>,
}

impl AgentChange {
    /// A status-only change.
    pub fn status(status: AgentStatus) -> Self {
        Self {
            status: Some(status),
            metrics_bucket: None,
        }
    }

    /// A buckets-only change.
    pub fn buckets(buckets: Vec<MetricsBucket>) -> Self {
        Self {
            status: None,
            metrics_bucket: Some(buckets),
        }
    }
}

/// Snapshot row returned by `Supervisor::agents_list`.
///
/// `status` is `None` while no status has been reported yet or after the
/// agent reported DONE on its own.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub status: Option<AgentStatus>,
    pub listen_port: Option<u16>,
    pub process_exec_path: Option<String>,
}
