//! # Runner: bounded concurrent execution of actions and jobs.
//!
//! ```text
//! start_action / start_job ──try_send──► queue (queue_capacity)
//!                                           │
//!                               run(ctx) dispatch loop
//!                                           │ one task per item, cancel token registered
//!                                           ▼
//!                  admission: local[token] ─► global ─► execute (timeout) ─► result channel
//!                                                                               │
//!                                                           cancel token removed (last)
//! ```
//!
//! ## Rules
//! - Enqueue never blocks: a full queue fails with an overflow error.
//! - Concurrency is limited at execution start, not at enqueue.
//! - A task waiting for admission can still be stopped; it then reports
//!   "context canceled" as its terminal message.
//! - Actions always run under a timeout (their own or the configured default);
//!   jobs only when they declare one.
//! - Every task produces exactly one terminal message.
//! - On shutdown the dispatch loop waits for every task, then closes both
//!   output channels.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::core::admission::{Admission, AdmissionPermit, token_from_dsn};
use crate::error::{RunnerError, TaskError};
use crate::tasks::{ActionRef, ActionResult, JobMessage, JobRef, JobSender};

/// Queue ends owned by the dispatch loop.
struct Dispatch {
    actions: mpsc::Receiver<ActionRef>,
    jobs: mpsc::Receiver<JobRef>,
    results: mpsc::Sender<ActionResult>,
    messages: mpsc::Sender<JobMessage>,
}

/// Per-task bookkeeping shared with the spawned tasks.
#[derive(Default)]
struct Tracking {
    next_gen: AtomicU64,
    cancels: RwLock<HashMap<String, (u64, CancellationToken)>>,
    executing: RwLock<HashSet<String>>,
}

impl Tracking {
    /// Registers the cancel token of a dispatched task and returns its generation.
    fn add_cancel(&self, id: &str, token: CancellationToken) -> u64 {
        let generation = self.next_gen.fetch_add(1, Ordering::Relaxed);
        let mut cancels = self.cancels.write().unwrap_or_else(|p| p.into_inner());
        if let Some((_, prev)) = cancels.insert(id.to_string(), (generation, token)) {
            warn!(task_id = %id, "task ID reused while still tracked");
            prev.cancel();
        }
        generation
    }

    fn remove_cancel(&self, id: &str, generation: u64) {
        let mut cancels = self.cancels.write().unwrap_or_else(|p| p.into_inner());
        // a newer task with the same ID keeps its entry
        if cancels.get(id).is_some_and(|(g, _)| *g == generation) {
            cancels.remove(id);
        }
    }

    fn cancel(&self, id: &str) {
        let cancels = self.cancels.read().unwrap_or_else(|p| p.into_inner());
        if let Some((_, token)) = cancels.get(id) {
            token.cancel();
        }
    }

    fn is_running(&self, id: &str) -> bool {
        let cancels = self.cancels.read().unwrap_or_else(|p| p.into_inner());
        cancels.contains_key(id)
    }

    fn is_executing(&self, id: &str) -> bool {
        let executing = self.executing.read().unwrap_or_else(|p| p.into_inner());
        executing.contains(id)
    }

    fn running_count(&self) -> usize {
        self.cancels.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn executing_count(&self) -> usize {
        self.executing.read().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// Marks a task as executing until dropped.
struct Executing {
    tracking: Arc<Tracking>,
    id: String,
}

impl Executing {
    fn mark(tracking: &Arc<Tracking>, id: &str) -> Self {
        tracking
            .executing
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.to_string());
        Self {
            tracking: tracking.clone(),
            id: id.to_string(),
        }
    }
}

impl Drop for Executing {
    fn drop(&mut self) {
        self.tracking
            .executing
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.id);
    }
}

/// Concurrent executor of actions and jobs.
pub struct Runner {
    default_action_timeout: Duration,
    admission: Arc<Admission>,
    tracking: Arc<Tracking>,
    actions_tx: mpsc::Sender<ActionRef>,
    jobs_tx: mpsc::Sender<JobRef>,
    dispatch: Mutex<Option<Dispatch>>,
    results_rx: Mutex<Option<mpsc::Receiver<ActionResult>>>,
    messages_rx: Mutex<Option<mpsc::Receiver<JobMessage>>>,
}

impl Runner {
    pub fn new(cfg: &RunnerConfig) -> Self {
        let queue = cfg.queue_capacity_clamped();
        let (actions_tx, actions) = mpsc::channel(queue);
        let (jobs_tx, jobs) = mpsc::channel(queue);
        let (results, results_rx) = mpsc::channel(queue);
        let (messages, messages_rx) = mpsc::channel(queue);

        info!(
            capacity = cfg.capacity(),
            token_capacity = cfg.token_capacity(),
            "runner configured"
        );

        Self {
            default_action_timeout: cfg.action_timeout(),
            admission: Admission::new(cfg.capacity(), cfg.token_capacity()),
            tracking: Arc::new(Tracking::default()),
            actions_tx,
            jobs_tx,
            dispatch: Mutex::new(Some(Dispatch {
                actions,
                jobs,
                results,
                messages,
            })),
            results_rx: Mutex::new(Some(results_rx)),
            messages_rx: Mutex::new(Some(messages_rx)),
        }
    }

    /// Enqueues an action without waiting.
    pub fn start_action(&self, action: ActionRef) -> Result<(), RunnerError> {
        self.actions_tx
            .try_send(action)
            .map_err(|_| RunnerError::ActionQueueOverflow)
    }

    /// Enqueues a job without waiting.
    pub fn start_job(&self, job: JobRef) -> Result<(), RunnerError> {
        self.jobs_tx
            .try_send(job)
            .map_err(|_| RunnerError::JobQueueOverflow)
    }

    /// Takes the action results stream. Returns `None` after the first call.
    pub fn actions_results(&self) -> Option<mpsc::Receiver<ActionResult>> {
        take(&self.results_rx)
    }

    /// Takes the job messages stream. Returns `None` after the first call.
    pub fn jobs_messages(&self) -> Option<mpsc::Receiver<JobMessage>> {
        take(&self.messages_rx)
    }

    /// Cancels the action or job with `id`. No-op for unknown or finished IDs.
    pub fn stop(&self, id: &str) {
        self.tracking.cancel(id);
    }

    /// True from dispatch until the task's terminal message was sent.
    pub fn is_running(&self, id: &str) -> bool {
        self.tracking.is_running(id)
    }

    /// True only while the task is past admission and executing.
    pub fn is_executing(&self, id: &str) -> bool {
        self.tracking.is_executing(id)
    }

    /// Number of dispatched, unfinished tasks.
    pub fn running_count(&self) -> usize {
        self.tracking.running_count()
    }

    /// Number of tasks past admission.
    pub fn executing_count(&self) -> usize {
        self.tracking.executing_count()
    }

    /// Dispatch loop. Returns after `ctx` is cancelled and every task finished.
    ///
    /// Can be called once; later calls fail with [`RunnerError::AlreadyRunning`].
    pub async fn run(&self, ctx: CancellationToken) -> Result<(), RunnerError> {
        let Some(mut d) = take(&self.dispatch) else {
            return Err(RunnerError::AlreadyRunning);
        };
        let mut set = JoinSet::new();

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                Some(action) = d.actions.recv() => {
                    self.spawn_action(&mut set, &ctx, action, d.results.clone());
                }
                Some(job) = d.jobs.recv() => {
                    self.spawn_job(&mut set, &ctx, job, d.messages.clone());
                }
                Some(res) = set.join_next(), if !set.is_empty() => {
                    if let Err(e) = res {
                        warn!(error = %e, "runner task panicked");
                    }
                }
            }
        }

        debug!(tasks = set.len(), "runner stopping, waiting for tasks");
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "runner task panicked");
            }
        }
        info!("runner stopped");
        Ok(())
    }

    fn spawn_action(
        &self,
        set: &mut JoinSet<()>,
        ctx: &CancellationToken,
        action: ActionRef,
        results: mpsc::Sender<ActionResult>,
    ) {
        let id = action.id().to_string();
        let timeout = action
            .timeout()
            .filter(|d| !d.is_zero())
            .unwrap_or(self.default_action_timeout);
        let token = token_from_dsn(action.dsn());
        let cancel = ctx.child_token();
        let generation = self.tracking.add_cancel(&id, cancel.clone());

        let admission = self.admission.clone();
        let tracking = self.tracking.clone();
        set.spawn(async move {
            let started = Instant::now();
            let (res, permit) = match admit(&admission, token.as_deref(), &cancel).await {
                None => (Err(TaskError::Canceled), None),
                Some(permit) => {
                    let _executing = Executing::mark(&tracking, &id);
                    info!(task_id = %id, action_type = action.action_type(), "action started");
                    let res = run_once(&cancel, Some(timeout), |c| action.run(c)).await;
                    (res, Some(permit))
                }
            };

            if let Err(e) = &res {
                warn!(task_id = %id, error = %e, label = e.as_label(), "action failed");
            }
            let _ = results.send(ActionResult::new(id.clone(), res)).await;
            drop(permit);

            info!(task_id = %id, duration = ?started.elapsed(), "action finished");
            tracking.remove_cancel(&id, generation);
        });
    }

    fn spawn_job(
        &self,
        set: &mut JoinSet<()>,
        ctx: &CancellationToken,
        job: JobRef,
        messages: mpsc::Sender<JobMessage>,
    ) {
        let id = job.id().to_string();
        let timeout = job.timeout();
        let token = token_from_dsn(job.dsn());
        let cancel = ctx.child_token();
        let generation = self.tracking.add_cancel(&id, cancel.clone());

        let admission = self.admission.clone();
        let tracking = self.tracking.clone();
        set.spawn(async move {
            let started = Instant::now();
            let (res, permit) = match admit(&admission, token.as_deref(), &cancel).await {
                None => (Err(TaskError::Canceled), None),
                Some(permit) => {
                    let _executing = Executing::mark(&tracking, &id);
                    info!(task_id = %id, job_type = job.job_type(), "job started");
                    let sender = JobSender::new(id.clone(), messages.clone());
                    let res = run_once(&cancel, timeout, |c| job.run(c, sender)).await;
                    (res, Some(permit))
                }
            };

            if let Err(e) = &res {
                warn!(task_id = %id, error = %e, label = e.as_label(), "job failed");
            }
            let _ = messages.send(JobMessage::result(id.clone(), res)).await;
            drop(permit);

            info!(task_id = %id, duration = ?started.elapsed(), "job finished");
            tracking.remove_cancel(&id, generation);
        });
    }
}

/// Waits for admission unless `cancel` fires first.
async fn admit(
    admission: &Arc<Admission>,
    token: Option<&str>,
    cancel: &CancellationToken,
) -> Option<AdmissionPermit> {
    tokio::select! {
        res = admission.acquire(token) => res.ok(),
        _ = cancel.cancelled() => None,
    }
}

/// Executes one task body under a child token and an optional timeout.
///
/// On timeout the child token is cancelled and [`TaskError::Timeout`] returned.
async fn run_once<F, Fut>(
    parent: &CancellationToken,
    timeout: Option<Duration>,
    body: F,
) -> Result<Vec<u8>, TaskError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<Vec<u8>, TaskError>>,
{
    let child = parent.child_token();

    match timeout.filter(|d| !d.is_zero()) {
        Some(dur) => match time::timeout(dur, body(child.clone())).await {
            Ok(res) => res,
            Err(_elapsed) => {
                child.cancel();
                Err(TaskError::Timeout { timeout: dur })
            }
        },
        None => body(child).await,
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|p| p.into_inner()).take()
}
