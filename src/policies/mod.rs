//! Restart delay policies for supervised processes.
//!
//! ## Contents
//! - [`BackoffPolicy`] how restart delays evolve (first / factor / max + jitter)
//! - [`JitterPolicy`]  randomization strategy so crashed exporters do not restart in lockstep
//!
//! ## Wiring
//! ```text
//! SupervisorConfig { restart_backoff: BackoffPolicy }
//!      └─► agents::Process uses backoff.next(restarts) between WAITING and STARTING
//! ```

mod backoff;
mod jitter;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
