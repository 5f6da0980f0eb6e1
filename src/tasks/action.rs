//! # Action and job abstractions.
//!
//! An [`Action`] is a short diagnostic task that always runs under a timeout
//! and yields one output. A [`Job`] may run for a long time, reports progress
//! through a [`JobSender`] and stops on timeout only if it declares one.
//!
//! Both receive a [`CancellationToken`] and should return promptly (usually
//! with [`TaskError::Canceled`]) once it fires.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::message::JobSender;
use crate::error::TaskError;

/// # Time-boxed diagnostic task.
///
/// # Example
/// ```
/// use async_trait::async_trait;
/// use tokio_util::sync::CancellationToken;
/// use agentvisor::{Action, TaskError};
///
/// struct Version;
///
/// #[async_trait]
/// impl Action for Version {
///     fn id(&self) -> &str { "/action_id/1" }
///     fn action_type(&self) -> &str { "version" }
///
///     async fn run(&self, ctx: CancellationToken) -> Result<Vec<u8>, TaskError> {
///         if ctx.is_cancelled() {
///             return Err(TaskError::Canceled);
///         }
///         Ok(b"1.0".to_vec())
///     }
/// }
/// ```
#[async_trait]
pub trait Action: Send + Sync + 'static {
    /// Unique ID, used by `Runner::stop`.
    fn id(&self) -> &str;

    /// Short type name for logs.
    fn action_type(&self) -> &str;

    /// Timeout; `None` or zero means the runner's default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Connection string of the target resource; empty if none.
    fn dsn(&self) -> &str {
        ""
    }

    async fn run(&self, ctx: CancellationToken) -> Result<Vec<u8>, TaskError>;
}

/// # Long-running, explicitly stoppable task.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn job_type(&self) -> &str;

    /// Timeout; `None` or zero means no timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn dsn(&self) -> &str {
        ""
    }

    /// Runs the job; progress goes through `send`, the returned output becomes
    /// the job's terminal result.
    async fn run(&self, ctx: CancellationToken, send: JobSender) -> Result<Vec<u8>, TaskError>;
}

/// Shared action handle.
pub type ActionRef = Arc<dyn Action>;

/// Shared job handle.
pub type JobRef = Arc<dyn Job>;
