//! # Agent runtime configuration.
//!
//! [`AgentConfig`] centralizes settings for the [`Supervisor`](crate::Supervisor)
//! and the [`Runner`](crate::Runner). It is deserializable so the host binary can
//! load it from whatever source it uses; loading itself is not done here.
//!
//! ## Sentinel values
//! - `runner.capacity = 0` → default capacity (32)
//! - `runner.token_capacity = 0` → default per-resource capacity (2)
//! - `runner.default_action_timeout = 0s` → 10s
//! - `supervisor.channel_capacity = 0` → clamped to 1
//! - `supervisor.start_attempts = 0` → clamped to 1

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policies::BackoffPolicy;

const DEFAULT_RUNNER_CAPACITY: usize = 32;
const DEFAULT_TOKEN_CAPACITY: usize = 2;
const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Top-level configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Listen port range handed out to exporter processes.
    pub ports: PortsConfig,
    /// Executable and working paths.
    pub paths: PathsConfig,
    /// Server connection details passed to templates (vmagent).
    pub server: ServerConfig,
    /// Action/job runner settings.
    pub runner: RunnerConfig,
    /// Supervisor settings.
    pub supervisor: SupervisorConfig,
    /// Number of log lines kept per agent.
    pub log_lines_count: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ports: PortsConfig::default(),
            paths: PathsConfig::default(),
            server: ServerConfig::default(),
            runner: RunnerConfig::default(),
            supervisor: SupervisorConfig::default(),
            log_lines_count: 1024,
        }
    }
}

impl AgentConfig {
    /// Returns the per-agent log capacity clamped to a minimum of 1.
    #[inline]
    pub fn log_lines_clamped(&self) -> usize {
        self.log_lines_count.max(1)
    }
}

/// Inclusive port range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub min: u16,
    pub max: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            min: 42000,
            max: 51999,
        }
    }
}

/// Paths to exporter binaries and the agent's scratch directory.
///
/// `None` means the exporter is not installed; starting an agent of that type
/// fails with [`StartError::NoPath`](crate::StartError::NoPath).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub paths_base: Option<PathBuf>,
    pub temp_dir: PathBuf,
    pub node_exporter: Option<PathBuf>,
    pub mysqld_exporter: Option<PathBuf>,
    pub mongodb_exporter: Option<PathBuf>,
    pub postgres_exporter: Option<PathBuf>,
    pub proxysql_exporter: Option<PathBuf>,
    pub rds_exporter: Option<PathBuf>,
    pub azure_exporter: Option<PathBuf>,
    pub vmagent: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            paths_base: None,
            temp_dir: std::env::temp_dir().join("agentvisor"),
            node_exporter: None,
            mysqld_exporter: None,
            mongodb_exporter: None,
            postgres_exporter: None,
            proxysql_exporter: None,
            rds_exporter: None,
            azure_exporter: None,
            vmagent: None,
        }
    }
}

/// Upstream server the agent reports to.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `host:port`.
    pub address: String,
    pub username: String,
    pub password: String,
    pub insecure_tls: bool,
    pub without_tls: bool,
}

impl ServerConfig {
    /// Base URL of the server, honoring `without_tls`.
    pub fn url(&self) -> String {
        let scheme = if self.without_tls { "http" } else { "https" };
        format!("{scheme}://{}", self.address)
    }
}

/// Runner admission and timeout settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Total number of actions/jobs executing at once (`0` = default).
    pub capacity: usize,
    /// Actions/jobs executing at once against one database instance (`0` = default).
    pub token_capacity: usize,
    /// Depth of the action and job submission queues.
    pub queue_capacity: usize,
    /// Timeout applied to actions that do not carry one.
    #[serde(with = "humantime_serde")]
    pub default_action_timeout: Duration,
}

impl RunnerConfig {
    /// Returns the global concurrency limit, substituting the default for `0`.
    #[inline]
    pub fn capacity(&self) -> usize {
        if self.capacity == 0 {
            DEFAULT_RUNNER_CAPACITY
        } else {
            self.capacity
        }
    }

    /// Returns the per-resource concurrency limit, substituting the default for `0`.
    #[inline]
    pub fn token_capacity(&self) -> usize {
        if self.token_capacity == 0 {
            DEFAULT_TOKEN_CAPACITY
        } else {
            self.token_capacity
        }
    }

    /// Returns the queue depth clamped to a minimum of 1.
    #[inline]
    pub fn queue_capacity_clamped(&self) -> usize {
        self.queue_capacity.max(1)
    }

    /// Returns the action timeout, substituting the default for `0s`.
    #[inline]
    pub fn action_timeout(&self) -> Duration {
        if self.default_action_timeout.is_zero() {
            DEFAULT_ACTION_TIMEOUT
        } else {
            self.default_action_timeout
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_RUNNER_CAPACITY,
            token_capacity: DEFAULT_TOKEN_CAPACITY,
            queue_capacity: 256,
            default_action_timeout: DEFAULT_ACTION_TIMEOUT,
        }
    }
}

/// Supervisor settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Depth of the `changes` and `qan_requests` output channels.
    pub channel_capacity: usize,
    /// How long a freshly spawned process must stay alive to be reported RUNNING.
    #[serde(with = "humantime_serde")]
    pub running_after: Duration,
    /// How long a start waits for the process to report RUNNING or INITIALIZATION_ERROR.
    #[serde(with = "humantime_serde")]
    pub start_wait: Duration,
    /// Start attempts for a process that fails initialization, each on a fresh port.
    pub start_attempts: u32,
    /// How long a stopping process may take to exit after SIGTERM before it is killed.
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,
    /// Delay policy between restarts of a process that exited on its own.
    #[serde(skip)]
    pub restart_backoff: BackoffPolicy,
}

impl SupervisorConfig {
    /// Returns the output channel depth clamped to a minimum of 1.
    #[inline]
    pub fn channel_capacity_clamped(&self) -> usize {
        self.channel_capacity.max(1)
    }

    /// Returns the number of start attempts clamped to a minimum of 1.
    #[inline]
    pub fn start_attempts_clamped(&self) -> u32 {
        self.start_attempts.max(1)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 10,
            running_after: Duration::from_secs(1),
            start_wait: Duration::from_secs(2),
            start_attempts: 3,
            stop_timeout: Duration::from_secs(5),
            restart_backoff: BackoffPolicy::default(),
        }
    }
}
