//! # Agent handles managed by the supervisor.
//!
//! Two kinds of agents exist:
//! - **process agents**: external exporter binaries, run by [`Process`];
//! - **built-in agents**: in-process collectors implementing [`BuiltinAgent`],
//!   created through a [`BuiltinFactory`].
//!
//! Both report status transitions on a private channel that closes only when
//! the handle has fully exited; the supervisor's forwarder uses that closure
//! as the agent's completion signal.

mod builtin;
mod logs;
mod noop;
mod params;
mod process;

pub use builtin::{BuiltinAgent, BuiltinFactory, DefaultBuiltins};
pub use logs::LogStore;
pub use noop::Noop;
pub use params::{AgentType, BuiltinParams, DesiredState, ProcessParams};
pub use process::{Process, ProcessSpec};
