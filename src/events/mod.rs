//! Agent status model and the messages the supervisor publishes.
//!
//! ## Contents
//! - [`AgentStatus`] lifecycle states reported by every agent handle
//! - [`StateChangedEvent`] one status transition, published on `Supervisor::changes`
//! - [`AgentChange`] what a built-in agent emits (status and/or QAN buckets)
//! - [`QanRequest`], [`MetricsBucket`] query analytics batches, published on `Supervisor::qan_requests`
//! - [`AgentInfo`] one row of `Supervisor::agents_list`
//!
//! ## Quick reference
//! ```text
//! Process ──AgentStatus──► forwarder ──StateChangedEvent──► changes
//! BuiltinAgent ──AgentChange──► forwarder ──┬─StateChangedEvent──► changes
//!                                           └─QanRequest─────────► qan_requests
//! ```

mod event;
mod status;

pub use event::{AgentChange, AgentInfo, MetricsBucket, QanRequest, StateChangedEvent};
pub use status::AgentStatus;
