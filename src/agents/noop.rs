//! Built-in agent that does nothing but walk through the status lifecycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::builtin::BuiltinAgent;
use super::logs::LogStore;
use crate::events::{AgentChange, AgentStatus};

/// STARTING → (after `startup`) RUNNING → (on cancel) STOPPING → DONE.
///
/// Cancelled before `startup` elapses: STARTING → STOPPING → DONE.
pub struct Noop {
    startup: Duration,
    logs: Arc<LogStore>,
}

impl Noop {
    pub fn new(startup: Duration, logs: Arc<LogStore>) -> Self {
        Self { startup, logs }
    }

    async fn emit(&self, changes: &mpsc::Sender<AgentChange>, status: AgentStatus) {
        self.logs.push(format!("status: {status}"));
        let _ = changes.send(AgentChange::status(status)).await;
    }
}

impl Collector for Noop {
    fn desc(&self) -> Vec<&Desc> {
        Vec::new()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        Vec::new()
    }
}

#[async_trait]
impl BuiltinAgent for Noop {
    async fn run(&self, ctx: CancellationToken, changes: mpsc::Sender<AgentChange>) {
        self.emit(&changes, AgentStatus::Starting).await;

        tokio::select! {
            _ = time::sleep(self.startup) => {
                self.emit(&changes, AgentStatus::Running).await;
                ctx.cancelled().await;
            }
            _ = ctx.cancelled() => {}
        }

        self.emit(&changes, AgentStatus::Stopping).await;
        self.emit(&changes, AgentStatus::Done).await;
    }
}
