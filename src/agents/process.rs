//! # Child process handle.
//!
//! [`Process`] keeps one exporter binary running until its context is
//! cancelled, restarting it with backoff when it exits on its own.
//!
//! ```text
//!            spawn ok                  alive for running_after
//! STARTING ─────────────► (probing) ───────────────────────────► RUNNING
//!    │                        │                                     │
//!    │ spawn failed           │ exited early                        │ exited
//!    ▼                        ▼                                     ▼
//! INITIALIZATION_ERROR ──► DONE                  STARTING ◄─ backoff ─ WAITING
//!
//! cancel while STARTING/RUNNING → STOPPING → SIGTERM (kill after stop_timeout) + reap → DONE
//! cancel while WAITING          → DONE
//! ```
//!
//! ## Rules
//! - Stopping sends SIGTERM and waits up to `stop_timeout` before killing.
//!   Non-unix targets are killed right away.
//! - The child is killed on drop, so an aborted handle never leaks a process.
//! - stdout and stderr lines go to the agent's [`LogStore`] after redaction.
//! - The status channel closes only after the child has been reaped.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::logs::LogStore;
use crate::events::AgentStatus;
use crate::policies::BackoffPolicy;

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Fully rendered command line of a process agent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub path: PathBuf,
    pub args: Vec<String>,
    /// `KEY=VALUE` entries added to the inherited environment.
    pub env: Vec<String>,
    pub redact_words: Vec<String>,
}

/// Handle running one child process.
pub struct Process {
    agent_id: String,
    spec: ProcessSpec,
    logs: Arc<LogStore>,
    running_after: Duration,
    stop_timeout: Duration,
    backoff: BackoffPolicy,
}

enum Exit {
    Cancelled,
    Exited,
}

impl Process {
    pub fn new(
        agent_id: impl Into<String>,
        spec: ProcessSpec,
        logs: Arc<LogStore>,
        running_after: Duration,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            spec,
            logs,
            running_after,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            backoff,
        }
    }

    /// How long a stopping process may take to exit after SIGTERM.
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Runs the process until `ctx` is cancelled, reporting every transition on `changes`.
    ///
    /// Returns after DONE was sent; `changes` is dropped on return.
    pub async fn run(self, ctx: CancellationToken, changes: mpsc::Sender<AgentStatus>) {
        let mut restarts: u32 = 0;

        loop {
            self.emit(&changes, AgentStatus::Starting).await;

            let mut child = match self.spawn() {
                Ok(child) => child,
                Err(e) => {
                    warn!(agent_id = %self.agent_id, path = %self.spec.path.display(), error = %e, "failed to start process");
                    self.logs.push(format!("failed to start: {e}"));
                    self.emit(&changes, AgentStatus::InitializationError).await;
                    break;
                }
            };

            tokio::select! {
                res = child.wait() => {
                    self.log_exit(res);
                    self.emit(&changes, AgentStatus::InitializationError).await;
                    break;
                }
                _ = ctx.cancelled() => {
                    self.stop(&changes, &mut child).await;
                    break;
                }
                _ = time::sleep(self.running_after) => {
                    self.emit(&changes, AgentStatus::Running).await;
                }
            }

            match self.supervise(&ctx, &changes, &mut child).await {
                Exit::Cancelled => break,
                Exit::Exited => {}
            }

            self.emit(&changes, AgentStatus::Waiting).await;
            let delay = self.backoff.next(restarts);
            restarts = restarts.saturating_add(1);
            debug!(agent_id = %self.agent_id, ?delay, restarts, "process exited, restarting");

            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = ctx.cancelled() => break,
            }
        }

        self.emit(&changes, AgentStatus::Done).await;
    }

    async fn supervise(
        &self,
        ctx: &CancellationToken,
        changes: &mpsc::Sender<AgentStatus>,
        child: &mut Child,
    ) -> Exit {
        tokio::select! {
            res = child.wait() => {
                self.log_exit(res);
                Exit::Exited
            }
            _ = ctx.cancelled() => {
                self.stop(changes, child).await;
                Exit::Cancelled
            }
        }
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.spec.path);
        cmd.args(&self.spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for kv in &self.spec.env {
            match kv.split_once('=') {
                Some((k, v)) => {
                    cmd.env(k, v);
                }
                None => {
                    warn!(agent_id = %self.agent_id, entry = %kv, "ignoring env entry without '='");
                }
            }
        }

        let mut child = cmd.spawn()?;
        let words = Arc::new(self.spec.redact_words.clone());
        if let Some(out) = child.stdout.take() {
            capture(out, self.logs.clone(), words.clone());
        }
        if let Some(err) = child.stderr.take() {
            capture(err, self.logs.clone(), words);
        }
        Ok(child)
    }

    async fn stop(&self, changes: &mpsc::Sender<AgentStatus>, child: &mut Child) {
        self.emit(changes, AgentStatus::Stopping).await;
        if terminate(child) {
            match time::timeout(self.stop_timeout, child.wait()).await {
                Ok(res) => {
                    self.log_exit(res);
                    return;
                }
                Err(_) => {
                    warn!(agent_id = %self.agent_id, timeout = ?self.stop_timeout, "process ignored SIGTERM, killing");
                }
            }
        }
        if let Err(e) = child.kill().await {
            warn!(agent_id = %self.agent_id, error = %e, "failed to kill process");
        }
    }

    fn log_exit(&self, res: std::io::Result<ExitStatus>) {
        match res {
            Ok(status) => {
                debug!(agent_id = %self.agent_id, %status, "process exited");
                self.logs.push(format!("process exited: {status}"));
            }
            Err(e) => {
                warn!(agent_id = %self.agent_id, error = %e, "failed to wait for process");
                self.logs.push(format!("failed to wait for process: {e}"));
            }
        }
    }

    async fn emit(&self, changes: &mpsc::Sender<AgentStatus>, status: AgentStatus) {
        debug!(agent_id = %self.agent_id, %status, "process status");
        let _ = changes.send(status).await;
    }
}

/// Sends SIGTERM to the child. Returns false if it could not be signalled.
#[cfg(unix)]
fn terminate(child: &Child) -> bool {
    let Some(pid) = child.id().and_then(|id| libc::pid_t::try_from(id).ok()) else {
        return false;
    };
    // SAFETY: `pid` is our own child and has not been reaped yet.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) -> bool {
    false
}

/// Copies lines from `reader` into `logs` until EOF.
fn capture<R>(reader: R, logs: Arc<LogStore>, words: Arc<Vec<String>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            logs.push(redact(&line, &words));
        }
    });
}

/// Replaces every occurrence of each non-empty word with `***`.
pub(crate) fn redact(line: &str, words: &[String]) -> String {
    words
        .iter()
        .filter(|w| !w.is_empty())
        .fold(line.to_string(), |acc, w| acc.replace(w.as_str(), "***"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policies::JitterPolicy;

    fn backoff() -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(10),
            max: Duration::from_millis(10),
            factor: 1.0,
            jitter: JitterPolicy::None,
        }
    }

    fn spec(path: &str, args: &[&str]) -> ProcessSpec {
        ProcessSpec {
            path: PathBuf::from(path),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    async fn collect(mut rx: mpsc::Receiver<AgentStatus>) -> Vec<AgentStatus> {
        let mut out = Vec::new();
        while let Some(s) = rx.recv().await {
            out.push(s);
        }
        out
    }

    #[test]
    fn test_redact() {
        let words = vec!["secret".to_string(), String::new()];
        assert_eq!(redact("user=root pass=secret", &words), "user=root pass=***");
    }

    #[tokio::test]
    async fn test_sleep_until_cancelled() {
        let logs = Arc::new(LogStore::new(16));
        let p = Process::new(
            "a",
            spec("sleep", &["10"]),
            logs,
            Duration::from_millis(100),
            backoff(),
        );
        let ctx = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let join = tokio::spawn(p.run(ctx.clone(), tx));

        assert_eq!(rx.recv().await, Some(AgentStatus::Starting));
        assert_eq!(rx.recv().await, Some(AgentStatus::Running));
        ctx.cancel();
        assert_eq!(collect(rx).await, vec![AgentStatus::Stopping, AgentStatus::Done]);
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_early_exit_is_initialization_error() {
        let p = Process::new(
            "b",
            spec("sleep", &["wrong format"]),
            Arc::new(LogStore::new(16)),
            Duration::from_secs(5),
            backoff(),
        );
        let (tx, rx) = mpsc::channel(16);
        p.run(CancellationToken::new(), tx).await;

        assert_eq!(
            collect(rx).await,
            vec![
                AgentStatus::Starting,
                AgentStatus::InitializationError,
                AgentStatus::Done
            ]
        );
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let logs = Arc::new(LogStore::new(16));
        let p = Process::new(
            "c",
            spec("/nonexistent/agentvisor-test-binary", &[]),
            logs.clone(),
            Duration::from_millis(100),
            backoff(),
        );
        let (tx, rx) = mpsc::channel(16);
        p.run(CancellationToken::new(), tx).await;

        assert_eq!(
            collect(rx).await,
            vec![
                AgentStatus::Starting,
                AgentStatus::InitializationError,
                AgentStatus::Done
            ]
        );
        assert!(logs.lines().0[0].starts_with("failed to start"));
    }

    #[tokio::test]
    async fn test_restarts_after_unexpected_exit() {
        let p = Process::new(
            "d",
            spec("sh", &["-c", "sleep 0.2"]),
            Arc::new(LogStore::new(16)),
            Duration::from_millis(50),
            backoff(),
        );
        let ctx = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let join = tokio::spawn(p.run(ctx.clone(), tx));

        assert_eq!(rx.recv().await, Some(AgentStatus::Starting));
        assert_eq!(rx.recv().await, Some(AgentStatus::Running));
        assert_eq!(rx.recv().await, Some(AgentStatus::Waiting));
        assert_eq!(rx.recv().await, Some(AgentStatus::Starting));
        ctx.cancel();
        join.await.unwrap();

        let rest = collect(rx).await;
        assert_eq!(rest.last(), Some(&AgentStatus::Done));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_sends_sigterm_first() {
        let logs = Arc::new(LogStore::new(16));
        let p = Process::new(
            "f",
            spec("sh", &["-c", "trap 'echo terminated; exit 0' TERM; sleep 10 & wait"]),
            logs.clone(),
            Duration::from_millis(200),
            backoff(),
        );
        let ctx = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let join = tokio::spawn(p.run(ctx.clone(), tx));

        assert_eq!(rx.recv().await, Some(AgentStatus::Starting));
        assert_eq!(rx.recv().await, Some(AgentStatus::Running));
        let stopping = std::time::Instant::now();
        ctx.cancel();
        assert_eq!(collect(rx).await, vec![AgentStatus::Stopping, AgentStatus::Done]);
        join.await.unwrap();
        assert!(stopping.elapsed() < Duration::from_secs(4));

        time::sleep(Duration::from_millis(100)).await;
        assert!(logs.lines().0.contains(&"terminated".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_after_stop_timeout() {
        let p = Process::new(
            "g",
            spec("sh", &["-c", "trap '' TERM; sleep 10"]),
            Arc::new(LogStore::new(16)),
            Duration::from_millis(200),
            backoff(),
        )
        .with_stop_timeout(Duration::from_millis(300));
        let ctx = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let join = tokio::spawn(p.run(ctx.clone(), tx));

        assert_eq!(rx.recv().await, Some(AgentStatus::Starting));
        assert_eq!(rx.recv().await, Some(AgentStatus::Running));
        let stopping = std::time::Instant::now();
        ctx.cancel();
        assert_eq!(collect(rx).await, vec![AgentStatus::Stopping, AgentStatus::Done]);
        join.await.unwrap();

        let elapsed = stopping.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_output_is_captured_and_redacted() {
        let logs = Arc::new(LogStore::new(16));
        let mut s = spec("sh", &["-c", "echo password=hunter2; sleep 10"]);
        s.redact_words = vec!["hunter2".into()];
        let p = Process::new("e", s, logs.clone(), Duration::from_millis(200), backoff());
        let ctx = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let join = tokio::spawn(p.run(ctx.clone(), tx));

        assert_eq!(rx.recv().await, Some(AgentStatus::Starting));
        assert_eq!(rx.recv().await, Some(AgentStatus::Running));
        ctx.cancel();
        join.await.unwrap();

        assert!(logs.lines().0.contains(&"password=***".to_string()));
    }
}
