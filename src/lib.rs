//! # agentvisor
//!
//! **Agentvisor** is the local runtime of a monitoring agent that lives on a
//! database host.
//!
//! It keeps a set of exporter processes and in-process collectors converged
//! to a desired state pushed by a remote server, hands out listen ports to
//! the exporters and executes short diagnostic actions and long-running jobs
//! with bounded concurrency.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!             DesiredState (from server)
//!                       │
//!                       ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Supervisor                                                       │
//! │  - filter (start / restart / stop plan)                           │
//! │  - PortsRegistry (listen ports of exporter processes)             │
//! │  - TemplateRenderer (config files, args, env, DSN)                │
//! │  - StatusTracker (last known status per agent)                    │
//! └──────┬──────────────────┬──────────────────┬──────────────────────┘
//!        ▼                  ▼                  ▼
//!  ┌────────────┐     ┌────────────┐     ┌──────────────┐
//!  │  Process   │     │  Process   │     │ BuiltinAgent │
//!  │ (exporter) │     │ (vmagent)  │     │  (QAN, noop) │
//!  └─────┬──────┘     └─────┬──────┘     └──────┬───────┘
//!        │ AgentStatus      │ AgentStatus       │ AgentChange
//!        ▼                  ▼                   ▼
//!     forwarder          forwarder           forwarder
//!        └──────────┬───────┘            ┌──────┴──────┐
//!                   ▼                    ▼             ▼
//!               changes ◄─────────────────       qan_requests
//!          (StateChangedEvent)                   (QanRequest)
//!
//!
//!  start_action / start_job
//!            │
//!            ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Runner                                                           │
//! │  - bounded queues (overflow rejected)                             │
//! │  - admission: per-resource semaphore ─► global semaphore          │
//! │  - timeout + cancellation per task                                │
//! └──────────────┬──────────────────────────────────┬─────────────────┘
//!                ▼                                  ▼
//!         actions_results                      jobs_messages
//!         (ActionResult)             (JobMessage: progress..., result)
//! ```
//!
//! ### Process agent lifecycle
//! ```text
//! STARTING ─► spawn ─┬─ failed / exited before running_after ─► INITIALIZATION_ERROR ─► DONE
//!                    └─ alive after running_after ─► RUNNING
//!                                                      │ exited
//!                                                      ▼
//!                                    WAITING ─► backoff ─► STARTING ...
//! cancel (any state) ─► STOPPING ─► SIGTERM ─► kill after stop_timeout ─► DONE
//! ```
//!
//! ## Features
//! | Area            | Description                                               | Key types / traits                          |
//! |-----------------|-----------------------------------------------------------|---------------------------------------------|
//! | **Supervision** | Converge agents to a desired state, report status changes | [`Supervisor`], [`DesiredState`]            |
//! | **Agents**      | Exporter processes and pluggable built-in collectors      | [`Process`], [`BuiltinAgent`], [`BuiltinFactory`] |
//! | **Ports**       | Listen port allocation with wrap-around scanning          | [`PortsRegistry`]                           |
//! | **Templates**   | Render config files, args and env of agents               | [`TemplateRenderer`]                        |
//! | **Tasks**       | Actions and jobs with bounded concurrency                 | [`Runner`], [`Action`], [`Job`]             |
//! | **Policies**    | Restart backoff of exporter processes                     | [`BackoffPolicy`], [`JitterPolicy`]         |
//! | **Metrics**     | Built-in agents scraped as one `prometheus` collector     | [`AgentsCollector`]                         |
//! | **Errors**      | Typed errors with stable labels                           | [`StartError`], [`RunnerError`], [`TaskError`] |
//! | **Config**      | Deserializable runtime settings                           | [`AgentConfig`]                             |
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use agentvisor::{AgentConfig, AgentStatus, AgentType, BuiltinParams, DefaultBuiltins, DesiredState, Supervisor};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = CancellationToken::new();
//!     let factory = Arc::new(DefaultBuiltins::new(Duration::from_millis(10)));
//!     let sup = Supervisor::new(ctx.clone(), AgentConfig::default(), factory)?;
//!     let mut changes = sup.changes().expect("first call");
//!
//!     let mut state = DesiredState::default();
//!     state
//!         .builtin_agents
//!         .insert("/agent_id/noop".into(), BuiltinParams::new(AgentType::TestNoop, ""));
//!     sup.set_state(state).await;
//!
//!     while let Some(event) = changes.recv().await {
//!         println!("{} -> {}", event.agent_id, event.status);
//!         if event.status == AgentStatus::Running {
//!             break;
//!         }
//!     }
//!
//!     // Stops every agent; the channel closes after the last DONE.
//!     ctx.cancel();
//!     while changes.recv().await.is_some() {}
//!     Ok(())
//! }
//! ```
mod agents;
mod config;
mod core;
mod error;
mod events;
mod metrics;
mod policies;
mod ports;
mod tasks;
mod templates;

// ---- Public re-exports ----

pub use agents::{
    AgentType, BuiltinAgent, BuiltinFactory, BuiltinParams, DefaultBuiltins, DesiredState,
    LogStore, Noop, Process, ProcessParams, ProcessSpec,
};
pub use config::{AgentConfig, PathsConfig, PortsConfig, RunnerConfig, ServerConfig, SupervisorConfig};
pub use core::{Runner, Supervisor};
pub use error::{PortsError, RunnerError, StartError, TaskError, TemplateError};
pub use events::{AgentChange, AgentInfo, AgentStatus, MetricsBucket, QanRequest, StateChangedEvent};
pub use metrics::AgentsCollector;
pub use policies::{BackoffPolicy, JitterPolicy};
pub use ports::PortsRegistry;
pub use tasks::{
    Action, ActionFn, ActionRef, ActionResult, Job, JobFn, JobMessage, JobProgress, JobRef,
    JobResult, JobSender, ProcessAction,
};
pub use templates::TemplateRenderer;
