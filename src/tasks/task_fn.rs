//! # Function-backed actions and jobs (`ActionFn`, `JobFn`).
//!
//! Both wrap a closure that *creates* a new future per run, so no state is
//! shared between runs unless the closure captures an `Arc<...>` explicitly.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use agentvisor::{Action, ActionFn, ActionRef, TaskError};
//!
//! let a: ActionRef = ActionFn::new("/action_id/1", "ping", |_ctx: CancellationToken| async {
//!     Ok::<_, TaskError>(b"pong".to_vec())
//! })
//! .with_timeout(Duration::from_secs(1))
//! .into_ref();
//!
//! assert_eq!(a.id(), "/action_id/1");
//! assert_eq!(a.timeout(), Some(Duration::from_secs(1)));
//! ```

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::action::{Action, ActionRef, Job, JobRef};
use super::message::JobSender;
use crate::error::TaskError;

/// Identity shared by both closure wrappers.
#[derive(Debug, Clone)]
struct Meta {
    id: String,
    kind: Cow<'static, str>,
    timeout: Option<Duration>,
    dsn: String,
}

impl Meta {
    fn new(id: impl Into<String>, kind: impl Into<Cow<'static, str>>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            timeout: None,
            dsn: String::new(),
        }
    }
}

/// Function-backed action.
#[derive(Debug)]
pub struct ActionFn<F> {
    meta: Meta,
    f: F,
}

impl<F> ActionFn<F> {
    pub fn new(id: impl Into<String>, action_type: impl Into<Cow<'static, str>>, f: F) -> Self {
        Self {
            meta: Meta::new(id, action_type),
            f,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.meta.timeout = Some(timeout);
        self
    }

    pub fn with_dsn(mut self, dsn: impl Into<String>) -> Self {
        self.meta.dsn = dsn.into();
        self
    }
}

impl<F, Fut> ActionFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, TaskError>> + Send + 'static,
{
    /// Wraps the action into a shared handle.
    pub fn into_ref(self) -> ActionRef {
        Arc::new(self)
    }
}

#[async_trait]
impl<F, Fut> Action for ActionFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, TaskError>> + Send + 'static,
{
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn action_type(&self) -> &str {
        &self.meta.kind
    }

    fn timeout(&self) -> Option<Duration> {
        self.meta.timeout
    }

    fn dsn(&self) -> &str {
        &self.meta.dsn
    }

    async fn run(&self, ctx: CancellationToken) -> Result<Vec<u8>, TaskError> {
        (self.f)(ctx).await
    }
}

/// Function-backed job.
#[derive(Debug)]
pub struct JobFn<F> {
    meta: Meta,
    f: F,
}

impl<F> JobFn<F> {
    pub fn new(id: impl Into<String>, job_type: impl Into<Cow<'static, str>>, f: F) -> Self {
        Self {
            meta: Meta::new(id, job_type),
            f,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.meta.timeout = Some(timeout);
        self
    }

    pub fn with_dsn(mut self, dsn: impl Into<String>) -> Self {
        self.meta.dsn = dsn.into();
        self
    }
}

impl<F, Fut> JobFn<F>
where
    F: Fn(CancellationToken, JobSender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, TaskError>> + Send + 'static,
{
    /// Wraps the job into a shared handle.
    pub fn into_ref(self) -> JobRef {
        Arc::new(self)
    }
}

#[async_trait]
impl<F, Fut> Job for JobFn<F>
where
    F: Fn(CancellationToken, JobSender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, TaskError>> + Send + 'static,
{
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn job_type(&self) -> &str {
        &self.meta.kind
    }

    fn timeout(&self) -> Option<Duration> {
        self.meta.timeout
    }

    fn dsn(&self) -> &str {
        &self.meta.dsn
    }

    async fn run(&self, ctx: CancellationToken, send: JobSender) -> Result<Vec<u8>, TaskError> {
        (self.f)(ctx, send).await
    }
}
