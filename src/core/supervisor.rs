//! # Supervisor: converges running agents to the desired state.
//!
//! The [`Supervisor`] owns the running-agent registry, the ports registry and
//! the two output channels. Every state change goes through one write lock,
//! so a `set_state` call never observes a half-applied previous call.
//!
//! ## Architecture
//! ```text
//! set_state(desired)
//!   └─► write lock
//!         ├─► filter(processes) ─► stop ─► restart (same port) ─► start (new port)
//!         └─► filter(builtins)  ─► stop ─► restart              ─► start
//!
//! per agent:
//!   handle (Process / BuiltinAgent) ──status──► forwarder ──► StatusTracker
//!                                                   ├──► changes       (StateChangedEvent)
//!                                                   └──► qan_requests  (built-ins only)
//!
//! ctx cancelled:
//!   stop_all() ─► every handle stopped and awaited ─► output channels closed
//! ```
//!
//! ## Rules
//! - Agent handles are cancelled only by the supervisor. On shutdown
//!   processes are stopped first, then built-ins, each in ID order.
//! - Stops wait for the agent's forwarder to finish, so all STOPPING/DONE
//!   events are published before a restarted or new agent starts.
//! - Restarts keep the process's port; stops release it.
//! - A start that fails synchronously is logged and not retried; the ID stays
//!   absent until a later `set_state` names it again.
//! - A process that fails initialization is retried on a fresh port up to
//!   `start_attempts` times. A start interrupted by cancellation is not
//!   retried and fails with `ShutDown`.
//! - Processes are reconciled before built-in agents. A process start returns
//!   after its RUNNING or INITIALIZATION_ERROR was published.
//! - The supervisor is an unchecked `prometheus` collector over its running
//!   built-in agents.
//! - Consumers of `changes`/`qan_requests` must drain until the channels close.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agents::{
    AgentType, BuiltinFactory, BuiltinParams, DesiredState, LogStore, Process, ProcessParams,
    ProcessSpec,
};
use crate::config::AgentConfig;
use crate::core::alive::StatusTracker;
use crate::core::filter::filter;
use crate::core::registry::{BuiltinEntry, Handle, ProcessEntry, Running};
use crate::error::{PortsError, StartError};
use crate::events::{AgentChange, AgentInfo, AgentStatus, QanRequest, StateChangedEvent};
use crate::metrics::AgentsCollector;
use crate::ports::PortsRegistry;
use crate::templates::TemplateRenderer;

/// Depth of each handle's private status channel.
const HANDLE_CHANNEL_CAPACITY: usize = 10;

/// Desired-state reconciler for process and built-in agents.
pub struct Supervisor {
    ctx: CancellationToken,
    cfg: AgentConfig,
    ports: PortsRegistry,
    factory: Arc<dyn BuiltinFactory>,
    running: RwLock<Running>,
    statuses: Arc<StatusTracker>,
    metrics: AgentsCollector,
    changes_rx: Mutex<Option<mpsc::Receiver<StateChangedEvent>>>,
    qan_rx: Mutex<Option<mpsc::Receiver<QanRequest>>>,
}

impl Supervisor {
    /// Creates a supervisor bound to `ctx`.
    ///
    /// Cancelling `ctx` stops every agent and then closes both output channels.
    /// Must be called within a tokio runtime.
    pub fn new(
        ctx: CancellationToken,
        cfg: AgentConfig,
        factory: Arc<dyn BuiltinFactory>,
    ) -> Result<Arc<Self>, PortsError> {
        let ports = PortsRegistry::new(cfg.ports.min, cfg.ports.max, [])?;
        let capacity = cfg.supervisor.channel_capacity_clamped();
        let (changes_tx, changes_rx) = mpsc::channel(capacity);
        let (qan_tx, qan_rx) = mpsc::channel(capacity);

        let sup = Arc::new(Self {
            ctx,
            cfg,
            ports,
            factory,
            running: RwLock::new(Running::new(changes_tx, qan_tx)),
            statuses: Arc::new(StatusTracker::new()),
            metrics: AgentsCollector::default(),
            changes_rx: Mutex::new(Some(changes_rx)),
            qan_rx: Mutex::new(Some(qan_rx)),
        });

        let me = sup.clone();
        tokio::spawn(async move {
            me.ctx.cancelled().await;
            me.stop_all().await;
        });

        Ok(sup)
    }

    /// Takes the status change stream. Returns `None` after the first call.
    pub fn changes(&self) -> Option<mpsc::Receiver<StateChangedEvent>> {
        take(&self.changes_rx)
    }

    /// Takes the QAN request stream. Returns `None` after the first call.
    pub fn qan_requests(&self) -> Option<mpsc::Receiver<QanRequest>> {
        take(&self.qan_rx)
    }

    /// Starts, restarts and stops agents so the running set matches `state`.
    ///
    /// Ignored once the supervisor's context is cancelled.
    pub async fn set_state(&self, state: DesiredState) {
        let mut running = self.running.write().await;

        if self.ctx.is_cancelled() || running.is_closed() {
            error!("ignoring set_state: supervisor is shutting down");
            return;
        }

        self.set_processes(&mut running, state.agent_processes).await;
        self.set_builtins(&mut running, state.builtin_agents).await;
    }

    /// Restarts every running agent with its last applied parameters.
    pub async fn restart_agents(&self) {
        let mut running = self.running.write().await;
        if running.is_closed() {
            return;
        }

        let mut ids: Vec<String> = running.processes.keys().cloned().collect();
        ids.sort_unstable();
        for id in ids {
            let Some(mut entry) = running.processes.remove(&id) else {
                continue;
            };
            entry.handle.stop(&id).await;
            if let Err(e) = self
                .start_process(&mut running, &id, entry.params, Some(entry.listen_port))
                .await
            {
                error!(agent_id = %id, error = %e, label = e.as_label(), "failed to restart agent");
            }
        }

        let mut ids: Vec<String> = running.builtins.keys().cloned().collect();
        ids.sort_unstable();
        for id in ids {
            let Some(mut entry) = self.remove_builtin(&mut running, &id) else {
                continue;
            };
            entry.handle.stop(&id).await;
            if let Err(e) = self.start_builtin(&mut running, &id, entry.params).await {
                error!(agent_id = %id, error = %e, label = e.as_label(), "failed to restart agent");
            }
        }
    }

    /// Returns every running agent, sorted by ID.
    pub async fn agents_list(&self) -> Vec<AgentInfo> {
        let running = self.running.read().await;
        let mut res = Vec::with_capacity(running.processes.len() + running.builtins.len());

        for (id, entry) in &running.processes {
            res.push(AgentInfo {
                agent_id: id.clone(),
                agent_type: entry.params.agent_type,
                status: self.statuses.get(id).await,
                listen_port: Some(entry.listen_port),
                process_exec_path: Some(entry.exec_path.clone()),
            });
        }
        for (id, entry) in &running.builtins {
            res.push(AgentInfo {
                agent_id: id.clone(),
                agent_type: entry.agent_type(),
                status: self.statuses.get(id).await,
                listen_port: None,
                process_exec_path: None,
            });
        }

        res.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        res
    }

    /// Returns the buffered logs of every running agent, keyed by `"<type> <id>"`.
    pub async fn agents_logs(&self) -> HashMap<String, Vec<String>> {
        let running = self.running.read().await;
        let processes = running
            .processes
            .iter()
            .map(|(id, e)| (e.params.agent_type, id, &e.logs));
        let builtins = running
            .builtins
            .iter()
            .map(|(id, e)| (e.agent_type(), id, &e.logs));

        processes
            .chain(builtins)
            .map(|(agent_type, id, logs)| (format!("{agent_type} {id}"), logs.lines().0))
            .collect()
    }

    /// Returns the buffered logs of one agent and the buffer capacity.
    pub async fn agent_log_by_id(&self, agent_id: &str) -> Option<(Vec<String>, usize)> {
        let running = self.running.read().await;
        if let Some(entry) = running.processes.get(agent_id) {
            return Some(entry.logs.lines());
        }
        running.builtins.get(agent_id).map(|e| e.logs.lines())
    }

    /// Metrics source of the running built-in agents, for a `prometheus::Registry`.
    pub fn metrics_collector(&self) -> AgentsCollector {
        self.metrics.clone()
    }

    async fn stop_all(&self) {
        let mut running = self.running.write().await;
        self.set_processes(&mut running, HashMap::new()).await;
        self.set_builtins(&mut running, HashMap::new()).await;

        running.changes = None;
        running.qan = None;
        info!("all agents stopped");
    }

    async fn set_processes(&self, running: &mut Running, desired: HashMap<String, ProcessParams>) {
        let plan = filter(&running.processes, &desired);
        if plan.is_empty() {
            return;
        }
        info!(
            start = plan.to_start.len(),
            restart = plan.to_restart.len(),
            stop = plan.to_stop.len(),
            "applying agent processes"
        );

        for id in &plan.to_stop {
            let Some(mut entry) = running.processes.remove(id) else {
                continue;
            };
            entry.handle.stop(id).await;
            self.release_port(id, entry.listen_port);
            self.cleanup_dir(entry.params.agent_type, id).await;
        }

        for id in &plan.to_restart {
            let (Some(mut entry), Some(params)) = (running.processes.remove(id), desired.get(id))
            else {
                continue;
            };
            entry.handle.stop(id).await;
            if let Err(e) = self
                .start_process(running, id, params.clone(), Some(entry.listen_port))
                .await
            {
                error!(agent_id = %id, error = %e, label = e.as_label(), "failed to restart agent");
            }
        }

        for id in &plan.to_start {
            let Some(params) = desired.get(id) else {
                continue;
            };
            if let Err(e) = self.start_process(running, id, params.clone(), None).await {
                error!(agent_id = %id, error = %e, label = e.as_label(), "failed to start agent");
            }
        }
    }

    async fn set_builtins(&self, running: &mut Running, desired: HashMap<String, BuiltinParams>) {
        let plan = filter(&running.builtins, &desired);
        if plan.is_empty() {
            return;
        }
        info!(
            start = plan.to_start.len(),
            restart = plan.to_restart.len(),
            stop = plan.to_stop.len(),
            "applying built-in agents"
        );

        for id in &plan.to_stop {
            let Some(mut entry) = self.remove_builtin(running, id) else {
                continue;
            };
            entry.handle.stop(id).await;
            self.cleanup_dir(entry.agent_type(), id).await;
        }

        for id in &plan.to_restart {
            let (Some(mut entry), Some(params)) =
                (self.remove_builtin(running, id), desired.get(id))
            else {
                continue;
            };
            entry.handle.stop(id).await;
            if let Err(e) = self.start_builtin(running, id, params.clone()).await {
                error!(agent_id = %id, error = %e, label = e.as_label(), "failed to restart agent");
            }
        }

        for id in &plan.to_start {
            let Some(params) = desired.get(id) else {
                continue;
            };
            if let Err(e) = self.start_builtin(running, id, params.clone()).await {
                error!(agent_id = %id, error = %e, label = e.as_label(), "failed to start agent");
            }
        }
    }

    /// Starts a process on `port` (or a freshly reserved one), retrying
    /// initialization failures on new ports.
    ///
    /// The port of a failed attempt is released before returning.
    async fn start_process(
        &self,
        running: &mut Running,
        agent_id: &str,
        params: ProcessParams,
        mut port: Option<u16>,
    ) -> Result<(), StartError> {
        let attempts = self.cfg.supervisor.start_attempts_clamped();
        let mut attempt = 0;

        loop {
            if self.ctx.is_cancelled() {
                if let Some(p) = port.take() {
                    self.release_port(agent_id, p);
                }
                return Err(StartError::ShutDown);
            }
            attempt += 1;
            let p = match port.take() {
                Some(p) => p,
                None => self.ports.reserve()?,
            };

            match self.spawn_process(running, agent_id, &params, p).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.release_port(agent_id, p);
                    if self.ctx.is_cancelled() {
                        return Err(StartError::ShutDown);
                    }
                    if !matches!(e, StartError::Initialization) || attempt >= attempts {
                        return Err(e);
                    }
                    warn!(agent_id, attempt, "agent failed to initialize, retrying on a new port");
                }
            }
        }
    }

    /// Spawns one process handle on `port` and waits for its initialization.
    async fn spawn_process(
        &self,
        running: &mut Running,
        agent_id: &str,
        params: &ProcessParams,
        port: u16,
    ) -> Result<(), StartError> {
        let changes = running.changes.clone().ok_or(StartError::ShutDown)?;
        let spec = self.process_spec(agent_id, params, port)?;
        let exec_path = spec.path.to_string_lossy().into_owned();
        let logs = Arc::new(LogStore::new(self.cfg.log_lines_clamped()));

        debug!(agent_id, agent_type = %params.agent_type, port, path = %exec_path, "starting process");
        let process = Process::new(
            agent_id,
            spec,
            logs.clone(),
            self.cfg.supervisor.running_after,
            self.cfg.supervisor.restart_backoff,
        )
        .with_stop_timeout(self.cfg.supervisor.stop_timeout);

        // stopped by the supervisor only, so shutdown follows reconciliation order
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(HANDLE_CHANNEL_CAPACITY);
        let (init_tx, init_rx) = oneshot::channel();
        tokio::spawn(process.run(cancel.clone(), tx));

        let fwd = ProcessForwarder {
            agent_id: agent_id.to_string(),
            port,
            exec_path: exec_path.clone(),
            statuses: self.statuses.clone(),
            changes,
            logs: logs.clone(),
        };
        let done = tokio::spawn(fwd.run(rx, init_tx));
        let mut handle = Handle { cancel, done };

        let initialized = tokio::select! {
            res = init_rx => res.unwrap_or(false),
            _ = time::sleep(self.cfg.supervisor.start_wait) => true,
            _ = self.ctx.cancelled() => false,
        };
        if !initialized {
            handle.stop(agent_id).await;
            if self.ctx.is_cancelled() {
                return Err(StartError::ShutDown);
            }
            return Err(StartError::Initialization);
        }

        running.processes.insert(
            agent_id.to_string(),
            ProcessEntry {
                handle,
                params: params.clone(),
                listen_port: port,
                exec_path,
                logs,
            },
        );
        Ok(())
    }

    /// Resolves the executable and renders args, env and text files.
    fn process_spec(
        &self,
        agent_id: &str,
        params: &ProcessParams,
        port: u16,
    ) -> Result<ProcessSpec, StartError> {
        let paths = &self.cfg.paths;
        let mut values = BTreeMap::from([("listen_port".to_string(), port.to_string())]);
        let paths_base = paths
            .paths_base
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let path = match params.agent_type {
            AgentType::NodeExporter => {
                values.insert("paths_base".into(), paths_base);
                paths.node_exporter.clone()
            }
            AgentType::MysqldExporter => {
                values.insert("paths_base".into(), paths_base);
                paths.mysqld_exporter.clone()
            }
            AgentType::PostgresExporter => {
                values.insert("paths_base".into(), paths_base);
                paths.postgres_exporter.clone()
            }
            AgentType::MongodbExporter => paths.mongodb_exporter.clone(),
            AgentType::ProxysqlExporter => paths.proxysql_exporter.clone(),
            AgentType::RdsExporter => paths.rds_exporter.clone(),
            AgentType::AzureDatabaseExporter => paths.azure_exporter.clone(),
            AgentType::Vmagent => {
                let server = &self.cfg.server;
                values.insert("server_url".into(), server.url());
                values.insert("server_insecure".into(), server.insecure_tls.to_string());
                values.insert("server_username".into(), server.username.clone());
                values.insert("server_password".into(), server.password.clone());
                values.insert(
                    "tmp_dir".into(),
                    paths.temp_dir.to_string_lossy().into_owned(),
                );
                paths.vmagent.clone()
            }
            AgentType::TestSleep => Some(PathBuf::from("sleep")),
            other => return Err(StartError::UnsupportedType(other)),
        };
        let path = path
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(StartError::NoPath(params.agent_type))?;

        let mut renderer = TemplateRenderer::new(
            self.agent_dir(params.agent_type, agent_id),
            values,
            params.template_left_delim.as_deref(),
            params.template_right_delim.as_deref(),
        )?;
        renderer.render_files(&params.text_files)?;

        Ok(ProcessSpec {
            path,
            args: renderer.render_all("args", &params.args)?,
            env: renderer.render_all("env", &params.env)?,
            redact_words: params.redact_words.clone(),
        })
    }

    async fn start_builtin(
        &self,
        running: &mut Running,
        agent_id: &str,
        params: BuiltinParams,
    ) -> Result<(), StartError> {
        if self.ctx.is_cancelled() {
            return Err(StartError::ShutDown);
        }
        let (Some(changes), Some(qan)) = (running.changes.clone(), running.qan.clone()) else {
            return Err(StartError::ShutDown);
        };

        let dsn = if params.text_files.is_empty() {
            params.dsn.clone()
        } else {
            let mut renderer = TemplateRenderer::new(
                self.agent_dir(params.agent_type, agent_id),
                BTreeMap::new(),
                None,
                None,
            )?;
            renderer.render_files(&params.text_files)?;
            renderer.render("dsn", &params.dsn)?
        };

        let logs = Arc::new(LogStore::new(self.cfg.log_lines_clamped()));
        let agent = self.factory.build(agent_id, &params, dsn, logs.clone())?;
        debug!(agent_id, agent_type = %params.agent_type, "starting built-in agent");

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(HANDLE_CHANNEL_CAPACITY);
        self.metrics.insert(agent_id, agent.clone());
        let runner = agent;
        let token = cancel.clone();
        tokio::spawn(async move { runner.run(token, tx).await });

        let fwd = BuiltinForwarder {
            agent_id: agent_id.to_string(),
            statuses: self.statuses.clone(),
            changes,
            qan,
            logs: logs.clone(),
        };
        let done = tokio::spawn(fwd.run(rx));

        running.builtins.insert(
            agent_id.to_string(),
            BuiltinEntry {
                handle: Handle { cancel, done },
                params,
                logs,
            },
        );
        Ok(())
    }

    fn remove_builtin(&self, running: &mut Running, agent_id: &str) -> Option<BuiltinEntry> {
        self.metrics.remove(agent_id);
        running.builtins.remove(agent_id)
    }

    fn agent_dir(&self, agent_type: AgentType, agent_id: &str) -> PathBuf {
        self.cfg
            .paths
            .temp_dir
            .join(agent_type.as_str())
            .join(agent_id)
    }

    fn release_port(&self, agent_id: &str, port: u16) {
        if let Err(e) = self.ports.release(port) {
            error!(agent_id, port, error = %e, label = e.as_label(), "failed to release port");
        }
    }

    async fn cleanup_dir(&self, agent_type: AgentType, agent_id: &str) {
        let dir = self.agent_dir(agent_type, agent_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(agent_id, dir = %dir.display(), error = %e, "failed to clean up agent directory");
            }
        }
    }
}

/// Unchecked collector over the running built-in agents.
impl Collector for Supervisor {
    fn desc(&self) -> Vec<&Desc> {
        self.metrics.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.metrics.collect()
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|p| p.into_inner()).take()
}

/// Copies a process handle's statuses to the tracker and the changes channel.
struct ProcessForwarder {
    agent_id: String,
    port: u16,
    exec_path: String,
    statuses: Arc<StatusTracker>,
    changes: mpsc::Sender<StateChangedEvent>,
    logs: Arc<LogStore>,
}

impl ProcessForwarder {
    /// Runs until the handle's channel closes.
    ///
    /// `init` resolves on the first RUNNING (`true`) or INITIALIZATION_ERROR (`false`).
    async fn run(self, mut rx: mpsc::Receiver<AgentStatus>, init: oneshot::Sender<bool>) {
        let mut init = Some(init);

        while let Some(status) = rx.recv().await {
            self.statuses.store(&self.agent_id, status).await;

            info!(agent_id = %self.agent_id, %status, port = self.port, "sending status");
            self.logs
                .push(format!("Sending status: {status} (port {}).", self.port));

            let event = StateChangedEvent::process(&self.agent_id, status, self.port, &self.exec_path);
            if self.changes.send(event).await.is_err() {
                debug!(agent_id = %self.agent_id, "changes receiver dropped");
            }

            // init resolves only after the event is queued
            let outcome = match status {
                AgentStatus::Running => Some(true),
                AgentStatus::InitializationError => Some(false),
                _ => None,
            };
            if let Some(ok) = outcome {
                if let Some(tx) = init.take() {
                    let _ = tx.send(ok);
                }
            }
        }
    }
}

/// Copies a built-in agent's changes to the tracker and both output channels.
struct BuiltinForwarder {
    agent_id: String,
    statuses: Arc<StatusTracker>,
    changes: mpsc::Sender<StateChangedEvent>,
    qan: mpsc::Sender<QanRequest>,
    logs: Arc<LogStore>,
}

impl BuiltinForwarder {
    async fn run(self, mut rx: mpsc::Receiver<AgentChange>) {
        while let Some(change) = rx.recv().await {
            if let Some(status) = change.status {
                self.statuses.store(&self.agent_id, status).await;
                info!(agent_id = %self.agent_id, %status, "sending status");
                self.logs.push(format!("Sending status: {status}."));

                let event = StateChangedEvent::builtin(&self.agent_id, status);
                if self.changes.send(event).await.is_err() {
                    debug!(agent_id = %self.agent_id, "changes receiver dropped");
                }
            }

            if let Some(buckets) = change.metrics_bucket {
                info!(agent_id = %self.agent_id, buckets = buckets.len(), "sending buckets");
                let request = QanRequest {
                    metrics_bucket: buckets,
                };
                if self.qan.send(request).await.is_err() {
                    debug!(agent_id = %self.agent_id, "qan receiver dropped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::{Duration, SystemTime};

    use async_trait::async_trait;
    use prometheus::{Gauge, Registry};

    use crate::agents::{BuiltinAgent, DefaultBuiltins};
    use crate::config::PortsConfig;
    use crate::events::MetricsBucket;
    use crate::policies::{BackoffPolicy, JitterPolicy};

    use crate::events::AgentStatus::*;

    const WAIT: Duration = Duration::from_secs(10);

    /// Prints supervisor logs for failing tests (`RUST_LOG=agentvisor=debug`).
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn config(tmp: &Path, min: u16) -> AgentConfig {
        let mut cfg = AgentConfig::default();
        cfg.ports = PortsConfig { min, max: min + 9 };
        cfg.paths.temp_dir = tmp.to_path_buf();
        cfg.supervisor.running_after = Duration::from_millis(200);
        cfg.supervisor.restart_backoff = BackoffPolicy {
            first: Duration::from_millis(50),
            max: Duration::from_millis(50),
            factor: 1.0,
            jitter: JitterPolicy::None,
        };
        cfg
    }

    fn setup_with(
        cfg: AgentConfig,
        factory: Arc<dyn BuiltinFactory>,
    ) -> (
        Arc<Supervisor>,
        CancellationToken,
        mpsc::Receiver<StateChangedEvent>,
    ) {
        init_tracing();
        let ctx = CancellationToken::new();
        let sup = Supervisor::new(ctx.clone(), cfg, factory).unwrap();
        let changes = sup.changes().unwrap();
        assert!(sup.changes().is_none());
        (sup, ctx, changes)
    }

    fn setup(
        tmp: &Path,
        min: u16,
    ) -> (
        Arc<Supervisor>,
        CancellationToken,
        mpsc::Receiver<StateChangedEvent>,
    ) {
        setup_with(
            config(tmp, min),
            Arc::new(DefaultBuiltins::new(Duration::from_millis(50))),
        )
    }

    async fn expect_changes(rx: &mut mpsc::Receiver<StateChangedEvent>, expected: Vec<StateChangedEvent>) {
        for want in expected {
            let got = time::timeout(WAIT, rx.recv())
                .await
                .expect("timed out waiting for a change");
            assert_eq!(got, Some(want));
        }
    }

    fn sleep_state(id: &str, args: &[&str]) -> DesiredState {
        let params = ProcessParams::new(AgentType::TestSleep, args.iter().copied());
        DesiredState {
            agent_processes: HashMap::from([(id.to_string(), params)]),
            ..Default::default()
        }
    }

    fn sleep_event(id: &str, status: AgentStatus, port: u16) -> StateChangedEvent {
        StateChangedEvent::process(id, status, port, "sleep")
    }

    #[tokio::test]
    async fn test_process_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let (sup, _ctx, mut changes) = setup(tmp.path(), 64000);

        sup.set_state(sleep_state("sleep1", &["10"])).await;
        expect_changes(
            &mut changes,
            vec![
                sleep_event("sleep1", Starting, 64000),
                sleep_event("sleep1", Running, 64000),
            ],
        )
        .await;
        assert_eq!(
            sup.agents_list().await,
            vec![AgentInfo {
                agent_id: "sleep1".into(),
                agent_type: AgentType::TestSleep,
                status: Some(Running),
                listen_port: Some(64000),
                process_exec_path: Some("sleep".into()),
            }]
        );

        sup.set_state(DesiredState::default()).await;
        expect_changes(
            &mut changes,
            vec![
                sleep_event("sleep1", Stopping, 64000),
                sleep_event("sleep1", Done, 64000),
            ],
        )
        .await;
        assert!(sup.agents_list().await.is_empty());
        assert_eq!(sup.ports.reserved_count(), 0);
    }

    #[tokio::test]
    async fn test_restart_keeps_port() {
        let tmp = tempfile::tempdir().unwrap();
        let (sup, _ctx, mut changes) = setup(tmp.path(), 64010);
        let port = 64010;

        sup.set_state(sleep_state("s", &["10"])).await;
        expect_changes(
            &mut changes,
            vec![sleep_event("s", Starting, port), sleep_event("s", Running, port)],
        )
        .await;

        // same params: nothing happens
        sup.set_state(sleep_state("s", &["10"])).await;
        assert!(changes.try_recv().is_err());

        sup.set_state(sleep_state("s", &["20"])).await;
        let restart = vec![
            sleep_event("s", Stopping, port),
            sleep_event("s", Done, port),
            sleep_event("s", Starting, port),
            sleep_event("s", Running, port),
        ];
        expect_changes(&mut changes, restart.clone()).await;

        sup.restart_agents().await;
        expect_changes(&mut changes, restart).await;
        assert_eq!(sup.ports.reserved_count(), 1);

        sup.set_state(DesiredState::default()).await;
        expect_changes(
            &mut changes,
            vec![sleep_event("s", Stopping, port), sleep_event("s", Done, port)],
        )
        .await;
        assert_eq!(sup.ports.reserved_count(), 0);
    }

    #[tokio::test]
    async fn test_initialization_error_retries_on_new_ports() {
        let tmp = tempfile::tempdir().unwrap();
        let (sup, _ctx, mut changes) = setup(tmp.path(), 64020);

        sup.set_state(sleep_state("sleep1", &["wrong format"])).await;

        let mut expected = Vec::new();
        for port in [64020, 64021, 64022] {
            expected.push(sleep_event("sleep1", Starting, port));
            expected.push(sleep_event("sleep1", InitializationError, port));
            expected.push(sleep_event("sleep1", Done, port));
        }
        expect_changes(&mut changes, expected).await;

        assert!(sup.agents_list().await.is_empty());
        assert_eq!(sup.ports.reserved_count(), 0);
    }

    #[tokio::test]
    async fn test_synchronous_start_failures_are_isolated() {
        let tmp = tempfile::tempdir().unwrap();
        let (sup, _ctx, mut changes) = setup(tmp.path(), 64030);

        let mut state = sleep_state("ok", &["10"]);
        state.agent_processes.insert(
            "no-path".into(),
            ProcessParams::new(AgentType::NodeExporter, ["--web.listen-address=:{{ .listen_port }}"]),
        );
        state.agent_processes.insert(
            "builtin-type".into(),
            ProcessParams::new(AgentType::QanMysqlSlowlogAgent, Vec::<String>::new()),
        );
        state.agent_processes.insert(
            "bad-template".into(),
            ProcessParams::new(AgentType::TestSleep, ["{{ .nope }}"]),
        );
        sup.set_state(state).await;

        let ids: Vec<String> = sup
            .agents_list()
            .await
            .into_iter()
            .map(|a| a.agent_id)
            .collect();
        assert_eq!(ids, vec!["ok"]);
        assert_eq!(sup.ports.reserved_count(), 1);

        let first = time::timeout(WAIT, changes.recv()).await.unwrap().unwrap();
        assert_eq!(first.agent_id, "ok");
    }

    #[tokio::test]
    async fn test_builtin_noop_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let (sup, _ctx, mut changes) = setup(tmp.path(), 64040);

        let state = DesiredState {
            builtin_agents: HashMap::from([(
                "noop1".to_string(),
                BuiltinParams::new(AgentType::TestNoop, ""),
            )]),
            ..Default::default()
        };
        sup.set_state(state).await;
        expect_changes(
            &mut changes,
            vec![
                StateChangedEvent::builtin("noop1", Starting),
                StateChangedEvent::builtin("noop1", Running),
            ],
        )
        .await;

        let list = sup.agents_list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].status, Some(Running));
        assert_eq!(list[0].listen_port, None);

        let logs = sup.agents_logs().await;
        assert!(logs["test_noop noop1"].contains(&"Sending status: STARTING.".to_string()));

        sup.set_state(DesiredState::default()).await;
        expect_changes(
            &mut changes,
            vec![
                StateChangedEvent::builtin("noop1", Stopping),
                StateChangedEvent::builtin("noop1", Done),
            ],
        )
        .await;
        assert!(sup.agents_list().await.is_empty());
    }

    struct Reporter {
        up: Gauge,
    }

    impl Reporter {
        fn new() -> Self {
            let up = Gauge::new("reporter_up", "Reporter is up.").unwrap();
            up.set(1.0);
            Self { up }
        }
    }

    impl Collector for Reporter {
        fn desc(&self) -> Vec<&Desc> {
            self.up.desc()
        }

        fn collect(&self) -> Vec<MetricFamily> {
            self.up.collect()
        }
    }

    fn bucket() -> MetricsBucket {
        MetricsBucket {
            agent_id: "qan1".into(),
            query_id: "q1".into(),
            fingerprint: "SELECT ?".into(),
            period_start: SystemTime::UNIX_EPOCH,
            period_length_secs: 60,
            num_queries: 3.0,
            query_time_sum: 0.5,
        }
    }

    #[async_trait]
    impl BuiltinAgent for Reporter {
        async fn run(&self, ctx: CancellationToken, changes: mpsc::Sender<AgentChange>) {
            let _ = changes.send(AgentChange::status(Running)).await;
            let _ = changes.send(AgentChange::buckets(vec![bucket()])).await;
            ctx.cancelled().await;
            let _ = changes.send(AgentChange::status(Done)).await;
        }
    }

    #[derive(Default)]
    struct ReporterFactory {
        dsns: Mutex<Vec<String>>,
    }

    impl BuiltinFactory for ReporterFactory {
        fn build(
            &self,
            _agent_id: &str,
            _params: &BuiltinParams,
            dsn: String,
            _logs: Arc<LogStore>,
        ) -> Result<Arc<dyn crate::agents::BuiltinAgent>, StartError> {
            self.dsns.lock().unwrap().push(dsn);
            Ok(Arc::new(Reporter::new()))
        }
    }

    #[tokio::test]
    async fn test_builtin_buckets_metrics_and_dsn() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = Arc::new(ReporterFactory::default());
        let (sup, _ctx, mut changes) = setup_with(config(tmp.path(), 64050), factory.clone());
        let mut qan = sup.qan_requests().unwrap();

        let mut params = BuiltinParams::new(
            AgentType::QanMysqlSlowlogAgent,
            "root@tcp(db:3306)/?ssl-ca={{ .TextFiles.Ca }}",
        );
        params.text_files.insert("Ca".into(), "cert".into());
        sup.set_state(DesiredState {
            builtin_agents: HashMap::from([("qan1".to_string(), params)]),
            ..Default::default()
        })
        .await;

        expect_changes(&mut changes, vec![StateChangedEvent::builtin("qan1", Running)]).await;
        let request = time::timeout(WAIT, qan.recv()).await.unwrap().unwrap();
        assert_eq!(request.metrics_bucket, vec![bucket()]);

        let dir = tmp.path().join("qan_mysql_slowlog_agent").join("qan1");
        assert_eq!(
            factory.dsns.lock().unwrap().clone(),
            vec![format!("root@tcp(db:3306)/?ssl-ca={}", dir.join("Ca").display())]
        );

        let registry = Registry::new();
        registry.register(Box::new(sup.metrics_collector())).unwrap();
        let families = registry.gather();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_name(), "reporter_up");
        assert_eq!(families[0].get_metric()[0].get_gauge().get_value(), 1.0);
        assert!(Collector::desc(&*sup).is_empty());
        assert_eq!(Collector::collect(&*sup).len(), 1);

        sup.set_state(DesiredState::default()).await;
        expect_changes(&mut changes, vec![StateChangedEvent::builtin("qan1", Done)]).await;
        assert!(!dir.exists());
        assert!(registry.gather().is_empty());
        assert_eq!(sup.metrics_collector().agents_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_agents_and_closes_channels() {
        let tmp = tempfile::tempdir().unwrap();
        let (sup, ctx, mut changes) = setup(tmp.path(), 64060);
        let mut qan = sup.qan_requests().unwrap();

        sup.set_state(sleep_state("s", &["10"])).await;
        expect_changes(
            &mut changes,
            vec![sleep_event("s", Starting, 64060), sleep_event("s", Running, 64060)],
        )
        .await;

        ctx.cancel();
        expect_changes(
            &mut changes,
            vec![sleep_event("s", Stopping, 64060), sleep_event("s", Done, 64060)],
        )
        .await;
        assert_eq!(time::timeout(WAIT, changes.recv()).await.unwrap(), None);
        assert!(time::timeout(WAIT, qan.recv()).await.unwrap().is_none());

        sup.set_state(sleep_state("s", &["10"])).await;
        assert!(sup.agents_list().await.is_empty());
        assert_eq!(sup.ports.reserved_count(), 0);
    }

    #[tokio::test]
    async fn test_process_spec_templates() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(tmp.path(), 64070);
        cfg.paths.paths_base = Some(PathBuf::from("/opt/base"));
        cfg.paths.mysqld_exporter = Some(PathBuf::from("/opt/base/exporters/mysqld_exporter"));
        cfg.paths.vmagent = Some(PathBuf::from("/opt/base/exporters/vmagent"));
        cfg.server.address = "server:8443".into();
        cfg.server.username = "admin".into();
        let (sup, _ctx, _changes) =
            setup_with(cfg, Arc::new(DefaultBuiltins::default()));

        let mut params = ProcessParams::new(
            AgentType::MysqldExporter,
            [
                "-web.listen-address=:{{ .listen_port }}",
                "-web.ssl-cert-file={{ .TextFiles.Cert }}",
                "-collect.custom={{ .paths_base }}/collectors",
            ],
        );
        params.env = vec!["HTTP_AUTH=pmm:{{ .listen_port }}".into()];
        params
            .text_files
            .insert("Cert".into(), "port={{ .listen_port }}".into());

        let spec = sup.process_spec("ID", &params, 12345).unwrap();
        let cert = tmp.path().join("mysqld_exporter").join("ID").join("Cert");
        assert_eq!(spec.path, PathBuf::from("/opt/base/exporters/mysqld_exporter"));
        assert_eq!(
            spec.args,
            vec![
                "-web.listen-address=:12345".to_string(),
                format!("-web.ssl-cert-file={}", cert.display()),
                "-collect.custom=/opt/base/collectors".to_string(),
            ]
        );
        assert_eq!(spec.env, vec!["HTTP_AUTH=pmm:12345"]);
        assert_eq!(std::fs::read_to_string(&cert).unwrap(), "port=12345");

        let vm = ProcessParams::new(
            AgentType::Vmagent,
            ["-remoteWrite.url={{ .server_url }}", "-u={{ .server_username }}", "-tmp={{ .tmp_dir }}"],
        );
        let spec = sup.process_spec("VM", &vm, 1).unwrap();
        assert_eq!(
            spec.args,
            vec![
                "-remoteWrite.url=https://server:8443".to_string(),
                "-u=admin".to_string(),
                format!("-tmp={}", tmp.path().display()),
            ]
        );

        let mut evil = params.clone();
        evil.text_files.insert("../../etc/passwd".into(), "x".into());
        assert!(matches!(
            sup.process_spec("ID", &evil, 1),
            Err(StartError::Template(_))
        ));

        let missing = ProcessParams::new(AgentType::RdsExporter, Vec::<String>::new());
        assert!(matches!(
            sup.process_spec("ID", &missing, 1),
            Err(StartError::NoPath(AgentType::RdsExporter))
        ));
    }

    #[tokio::test]
    async fn test_logs_and_temp_dir_cleanup() {
        let tmp = tempfile::tempdir().unwrap();
        let (sup, _ctx, mut changes) = setup(tmp.path(), 64080);

        let mut state = sleep_state("s1", &["10"]);
        if let Some(p) = state.agent_processes.get_mut("s1") {
            p.text_files.insert("f".into(), "x".into());
        }
        sup.set_state(state).await;
        expect_changes(
            &mut changes,
            vec![sleep_event("s1", Starting, 64080), sleep_event("s1", Running, 64080)],
        )
        .await;

        let dir = tmp.path().join("test_sleep").join("s1");
        assert!(dir.join("f").exists());

        let (lines, capacity) = sup.agent_log_by_id("s1").await.unwrap();
        assert_eq!(capacity, 1024);
        assert!(lines.contains(&"Sending status: STARTING (port 64080).".to_string()));
        assert!(sup.agents_logs().await.contains_key("test_sleep s1"));
        assert!(sup.agent_log_by_id("nope").await.is_none());

        sup.set_state(DesiredState::default()).await;
        expect_changes(
            &mut changes,
            vec![sleep_event("s1", Stopping, 64080), sleep_event("s1", Done, 64080)],
        )
        .await;
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_cancel_during_start_is_not_retried() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(tmp.path(), 64090);
        cfg.supervisor.running_after = Duration::from_millis(500);
        let (sup, ctx, mut changes) = setup_with(cfg, Arc::new(DefaultBuiltins::default()));

        let starter = sup.clone();
        let start = tokio::spawn(async move { starter.set_state(sleep_state("a", &["10"])).await });
        time::sleep(Duration::from_millis(100)).await;
        ctx.cancel();
        time::timeout(WAIT, start).await.unwrap().unwrap();

        let mut seen = Vec::new();
        while let Some(event) = time::timeout(WAIT, changes.recv()).await.unwrap() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                sleep_event("a", Starting, 64090),
                sleep_event("a", Stopping, 64090),
                sleep_event("a", Done, 64090),
            ]
        );
        assert_eq!(sup.ports.reserved_count(), 0);
        assert!(sup.agents_list().await.is_empty());
    }

    #[tokio::test]
    async fn test_processes_and_builtins_together() {
        let tmp = tempfile::tempdir().unwrap();
        let (sup, ctx, mut changes) = setup(tmp.path(), 64100);
        let noop = || BuiltinParams::new(AgentType::TestNoop, "");

        // start: whole process batch, then built-ins
        let mut state = sleep_state("s", &["10"]);
        state.builtin_agents.insert("n1".into(), noop());
        sup.set_state(state).await;
        expect_changes(
            &mut changes,
            vec![
                sleep_event("s", Starting, 64100),
                sleep_event("s", Running, 64100),
                StateChangedEvent::builtin("n1", Starting),
                StateChangedEvent::builtin("n1", Running),
            ],
        )
        .await;

        // restart s, keep n1, start n2
        let mut state = sleep_state("s", &["20"]);
        state.builtin_agents.insert("n1".into(), noop());
        state.builtin_agents.insert("n2".into(), noop());
        sup.set_state(state).await;
        expect_changes(
            &mut changes,
            vec![
                sleep_event("s", Stopping, 64100),
                sleep_event("s", Done, 64100),
                sleep_event("s", Starting, 64100),
                sleep_event("s", Running, 64100),
                StateChangedEvent::builtin("n2", Starting),
                StateChangedEvent::builtin("n2", Running),
            ],
        )
        .await;

        let ids: Vec<String> = sup
            .agents_list()
            .await
            .into_iter()
            .map(|a| a.agent_id)
            .collect();
        assert_eq!(ids, vec!["n1", "n2", "s"]);

        // shutdown: processes first, then built-ins in ID order
        ctx.cancel();
        expect_changes(
            &mut changes,
            vec![
                sleep_event("s", Stopping, 64100),
                sleep_event("s", Done, 64100),
                StateChangedEvent::builtin("n1", Stopping),
                StateChangedEvent::builtin("n1", Done),
                StateChangedEvent::builtin("n2", Stopping),
                StateChangedEvent::builtin("n2", Done),
            ],
        )
        .await;
        assert_eq!(time::timeout(WAIT, changes.recv()).await.unwrap(), None);
        assert_eq!(sup.ports.reserved_count(), 0);
    }
}
