//! Messages produced by the runner.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TaskError;

/// Terminal result of one action. Exactly one is produced per started action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_id: String,
    pub output: Vec<u8>,
    /// Error text; `None` on success.
    pub error: Option<String>,
    pub done: bool,
}

impl ActionResult {
    pub(crate) fn new(action_id: String, res: Result<Vec<u8>, TaskError>) -> Self {
        let (output, error) = match res {
            Ok(output) => (output, None),
            Err(e) => (Vec::new(), Some(e.to_string())),
        };
        Self {
            action_id,
            output,
            error,
            done: true,
        }
    }
}

/// Intermediate progress report of a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: String,
    pub at: SystemTime,
    pub message: String,
}

/// Terminal result of a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub at: SystemTime,
    pub output: Vec<u8>,
    pub error: Option<String>,
}

/// What a job publishes. Progress messages of one job precede its result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobMessage {
    Progress(JobProgress),
    Result(JobResult),
}

impl JobMessage {
    /// ID of the job the message belongs to.
    pub fn job_id(&self) -> &str {
        match self {
            JobMessage::Progress(p) => &p.job_id,
            JobMessage::Result(r) => &r.job_id,
        }
    }

    pub(crate) fn result(job_id: String, res: Result<Vec<u8>, TaskError>) -> Self {
        let (output, error) = match res {
            Ok(output) => (output, None),
            Err(e) => (Vec::new(), Some(e.to_string())),
        };
        JobMessage::Result(JobResult {
            job_id,
            at: SystemTime::now(),
            output,
            error,
        })
    }
}

/// Progress channel handed to a running job.
#[derive(Clone, Debug)]
pub struct JobSender {
    job_id: String,
    tx: mpsc::Sender<JobMessage>,
}

impl JobSender {
    pub(crate) fn new(job_id: impl Into<String>, tx: mpsc::Sender<JobMessage>) -> Self {
        Self {
            job_id: job_id.into(),
            tx,
        }
    }

    /// Publishes a progress message; waits while the channel is full.
    ///
    /// Messages are dropped silently once the consumer is gone.
    pub async fn progress(&self, message: impl Into<String>) {
        let msg = JobMessage::Progress(JobProgress {
            job_id: self.job_id.clone(),
            at: SystemTime::now(),
            message: message.into(),
        });
        let _ = self.tx.send(msg).await;
    }
}
