//! # Built-in agent contract and factory seam.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prometheus::core::Collector;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::logs::LogStore;
use super::noop::Noop;
use super::params::{AgentType, BuiltinParams};
use crate::error::StartError;
use crate::events::AgentChange;

/// # In-process collector run by the supervisor.
///
/// `run` reports status transitions and QAN buckets on `changes` and returns
/// once the agent has fully stopped. Dropping `changes` on return closes the
/// channel, which is the supervisor's completion signal; the last status sent
/// must be [`AgentStatus::Done`](crate::AgentStatus::Done).
///
/// Internal metrics are exposed through `prometheus::core::Collector` and
/// scraped via [`AgentsCollector`](crate::AgentsCollector).
#[async_trait]
pub trait BuiltinAgent: Collector + Send + Sync + 'static {
    async fn run(&self, ctx: CancellationToken, changes: mpsc::Sender<AgentChange>);
}

/// Creates built-in agents from their parameters.
///
/// `dsn` is already rendered; `params.dsn` is the raw template.
pub trait BuiltinFactory: Send + Sync + 'static {
    fn build(
        &self,
        agent_id: &str,
        params: &BuiltinParams,
        dsn: String,
        logs: Arc<LogStore>,
    ) -> Result<Arc<dyn BuiltinAgent>, StartError>;
}

/// Factory knowing only [`AgentType::TestNoop`].
///
/// Hosts with concrete QAN collectors provide their own [`BuiltinFactory`].
#[derive(Clone, Debug)]
pub struct DefaultBuiltins {
    noop_startup: Duration,
}

impl DefaultBuiltins {
    /// Noop agents report RUNNING after `noop_startup`.
    pub fn new(noop_startup: Duration) -> Self {
        Self { noop_startup }
    }
}

impl Default for DefaultBuiltins {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl BuiltinFactory for DefaultBuiltins {
    fn build(
        &self,
        _agent_id: &str,
        params: &BuiltinParams,
        _dsn: String,
        logs: Arc<LogStore>,
    ) -> Result<Arc<dyn BuiltinAgent>, StartError> {
        match params.agent_type {
            AgentType::TestNoop => Ok(Arc::new(Noop::new(self.noop_startup, logs))),
            other => Err(StartError::UnsupportedType(other)),
        }
    }
}
