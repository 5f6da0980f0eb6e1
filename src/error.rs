//! Error types used by the agent runtime.
//!
//! - [`PortsError`]: port allocation failures in [`PortsRegistry`](crate::PortsRegistry).
//! - [`TemplateError`]: rendering of args/env/text files/DSNs.
//! - [`StartError`]: a single agent could not be started.
//! - [`RunnerError`]: admission errors returned synchronously by the [`Runner`](crate::Runner).
//! - [`TaskError`]: failures of individual actions and jobs.
//!
//! Every enum provides `as_label()` with a short stable snake_case label for logs/metrics.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::agents::AgentType;

/// # Errors produced by the ports registry.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortsError {
    /// Every port of the range is either reserved or bound by someone else.
    #[error("no free port in range {min}-{max}")]
    NoFreePort { min: u16, max: u16 },

    /// The port was never reserved (or was already released).
    #[error("port {0} is not reserved")]
    NotReserved(u16),

    /// The port is reserved, but something outside the registry still listens on it.
    #[error("port {0} is busy")]
    Busy(u16),

    /// Range bounds are inverted.
    #[error("invalid port range {min}-{max}")]
    InvalidRange { min: u16, max: u16 },
}

impl PortsError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            PortsError::NoFreePort { .. } => "ports_no_free_port",
            PortsError::NotReserved(_) => "ports_not_reserved",
            PortsError::Busy(_) => "ports_busy",
            PortsError::InvalidRange { .. } => "ports_invalid_range",
        }
    }
}

/// # Errors produced while rendering agent templates.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TemplateError {
    /// Text file name would escape the agent's temporary directory.
    #[error("invalid text file name {0:?}")]
    UnsafeFileName(String),

    /// Template references a parameter that was not provided.
    #[error("template {template:?}: no value for key {key:?}")]
    MissingKey { template: String, key: String },

    /// Delimiters are empty or identical.
    #[error("invalid template delimiters {left:?} {right:?}")]
    InvalidDelimiters { left: String, right: String },

    /// Text file could not be written.
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TemplateError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            TemplateError::UnsafeFileName(_) => "template_unsafe_file_name",
            TemplateError::MissingKey { .. } => "template_missing_key",
            TemplateError::InvalidDelimiters { .. } => "template_invalid_delimiters",
            TemplateError::Io { .. } => "template_io",
        }
    }
}

/// # Errors that prevent one agent from being started.
///
/// Start failures are isolated to the affected agent ID; the supervisor logs
/// them and continues with the rest of the desired state.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StartError {
    /// Agent type is not handled by this kind of agent (process vs built-in).
    #[error("unhandled agent type {0}")]
    UnsupportedType(AgentType),

    /// No executable path configured for the agent type.
    #[error("no path for agent type {0}")]
    NoPath(AgentType),

    /// Template rendering failed.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Port could not be reserved.
    #[error(transparent)]
    Ports(#[from] PortsError),

    /// Built-in agent constructor failed.
    #[error("failed to create built-in agent: {error}")]
    Builtin { error: String },

    /// Process exited before it was considered running.
    #[error("agent exited during initialization")]
    Initialization,

    /// Supervisor already stopped every agent and closed its channels.
    #[error("supervisor is shut down")]
    ShutDown,
}

impl StartError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            StartError::UnsupportedType(_) => "start_unsupported_type",
            StartError::NoPath(_) => "start_no_path",
            StartError::Template(e) => e.as_label(),
            StartError::Ports(e) => e.as_label(),
            StartError::Builtin { .. } => "start_builtin_failed",
            StartError::Initialization => "start_initialization_failed",
            StartError::ShutDown => "start_shut_down",
        }
    }
}

/// # Errors returned synchronously by the runner.
#[non_exhaustive]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerError {
    /// Action queue is full; the action was not accepted.
    #[error("actions queue overflowed")]
    ActionQueueOverflow,

    /// Job queue is full; the job was not accepted.
    #[error("jobs queue overflowed")]
    JobQueueOverflow,

    /// `run` was called while another dispatch loop owns the queues.
    #[error("runner is already running")]
    AlreadyRunning,
}

impl RunnerError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            RunnerError::ActionQueueOverflow => "runner_action_queue_overflow",
            RunnerError::JobQueueOverflow => "runner_job_queue_overflow",
            RunnerError::AlreadyRunning => "runner_already_running",
        }
    }
}

/// # Errors produced by action and job execution.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Execution exceeded its timeout.
    #[error("timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Execution failed.
    #[error("{error}")]
    Fail { error: String },

    /// Execution was cancelled (explicit stop or runner shutdown).
    #[error("context canceled")]
    Canceled,
}

impl TaskError {
    /// Shorthand for [`TaskError::Fail`].
    pub fn fail(error: impl Into<String>) -> Self {
        TaskError::Fail {
            error: error.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use agentvisor::TaskError;
    /// use std::time::Duration;
    ///
    /// let err = TaskError::Timeout { timeout: Duration::from_secs(1) };
    /// assert_eq!(err.as_label(), "task_timeout");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Timeout { .. } => "task_timeout",
            TaskError::Fail { .. } => "task_failed",
            TaskError::Canceled => "task_canceled",
        }
    }
}
