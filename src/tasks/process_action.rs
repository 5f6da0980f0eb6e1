//! # Action running an external command.
//!
//! Succeeds with the command's stdout when it exits with status 0. Any other
//! exit fails with the status and the trimmed stderr. Cancellation kills the
//! child.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::action::Action;
use crate::error::TaskError;

/// Runs `path args...` and returns its stdout.
#[derive(Debug, Clone)]
pub struct ProcessAction {
    id: String,
    action_type: String,
    path: PathBuf,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl ProcessAction {
    pub fn new(
        id: impl Into<String>,
        path: impl Into<PathBuf>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            action_type: "process".to_string(),
            path: path.into(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_type(mut self, action_type: impl Into<String>) -> Self {
        self.action_type = action_type.into();
        self
    }
}

#[async_trait]
impl Action for ProcessAction {
    fn id(&self) -> &str {
        &self.id
    }

    fn action_type(&self) -> &str {
        &self.action_type
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn run(&self, ctx: CancellationToken) -> Result<Vec<u8>, TaskError> {
        let child = Command::new(&self.path)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TaskError::fail(format!("{}: {e}", self.path.display())))?;

        let output = tokio::select! {
            res = child.wait_with_output() => {
                res.map_err(|e| TaskError::fail(e.to_string()))?
            }
            _ = ctx.cancelled() => return Err(TaskError::Canceled),
        };

        if output.status.success() {
            return Ok(output.stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if stderr.is_empty() {
            Err(TaskError::fail(output.status.to_string()))
        } else {
            Err(TaskError::fail(format!("{}: {stderr}", output.status)))
        }
    }
}
