//! Runtime core: agent supervision and task execution.
//!
//! The public API of this module is [`Supervisor`] and [`Runner`].
//!
//! Internal modules:
//! - [`supervisor`]: reconciles running agents with the desired state;
//! - [`filter`]: computes the start/restart/stop plan of one reconciliation;
//! - [`registry`]: running agent entries and their handles;
//! - [`alive`]: last known status per agent;
//! - [`runner`]: executes actions and jobs with bounded concurrency;
//! - [`admission`]: global and per-resource semaphores used by the runner.

mod admission;
mod alive;
mod filter;
mod registry;
mod runner;
mod supervisor;

pub use runner::Runner;
pub use supervisor::Supervisor;
