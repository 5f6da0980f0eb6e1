//! Units of work executed by the [`Runner`](crate::Runner).
//!
//! - [`Action`] / [`Job`]: the task contracts.
//! - [`ActionFn`] / [`JobFn`]: closure-backed implementations.
//! - [`ProcessAction`]: runs an external command.
//! - [`ActionResult`], [`JobMessage`]: what the runner publishes.

mod action;
mod message;
mod process_action;
mod task_fn;

pub use action::{Action, ActionRef, Job, JobRef};
pub use message::{ActionResult, JobMessage, JobProgress, JobResult, JobSender};
pub use process_action::ProcessAction;
pub use task_fn::{ActionFn, JobFn};
