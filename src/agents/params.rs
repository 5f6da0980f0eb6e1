//! Desired-state parameters of one agent.
//!
//! These are the raw values received from the server. The supervisor compares
//! them with `==` to decide whether a running agent must be restarted, so they
//! never carry anything produced by template rendering.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    NodeExporter,
    MysqldExporter,
    MongodbExporter,
    PostgresExporter,
    ProxysqlExporter,
    RdsExporter,
    AzureDatabaseExporter,
    Vmagent,
    QanMysqlPerfschemaAgent,
    QanMysqlSlowlogAgent,
    QanMongodbProfilerAgent,
    QanPostgresqlPgstatementsAgent,
    QanPostgresqlPgstatmonitorAgent,
    /// Process agent running `sleep`; used by tests.
    TestSleep,
    /// Built-in agent doing nothing; used by tests.
    TestNoop,
}

impl AgentType {
    /// Stable snake_case name, also used as the temp dir component.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::NodeExporter => "node_exporter",
            AgentType::MysqldExporter => "mysqld_exporter",
            AgentType::MongodbExporter => "mongodb_exporter",
            AgentType::PostgresExporter => "postgres_exporter",
            AgentType::ProxysqlExporter => "proxysql_exporter",
            AgentType::RdsExporter => "rds_exporter",
            AgentType::AzureDatabaseExporter => "azure_database_exporter",
            AgentType::Vmagent => "vmagent",
            AgentType::QanMysqlPerfschemaAgent => "qan_mysql_perfschema_agent",
            AgentType::QanMysqlSlowlogAgent => "qan_mysql_slowlog_agent",
            AgentType::QanMongodbProfilerAgent => "qan_mongodb_profiler_agent",
            AgentType::QanPostgresqlPgstatementsAgent => "qan_postgresql_pgstatements_agent",
            AgentType::QanPostgresqlPgstatmonitorAgent => "qan_postgresql_pgstatmonitor_agent",
            AgentType::TestSleep => "test_sleep",
            AgentType::TestNoop => "test_noop",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a process agent.
///
/// `args`, `env` and `text_files` are templates rendered at start time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessParams {
    pub agent_type: AgentType,
    #[serde(default)]
    pub args: Vec<String>,
    /// `KEY=VALUE` entries.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub text_files: BTreeMap<String, String>,
    /// Words replaced with `***` in captured output.
    #[serde(default)]
    pub redact_words: Vec<String>,
    #[serde(default)]
    pub template_left_delim: Option<String>,
    #[serde(default)]
    pub template_right_delim: Option<String>,
}

impl ProcessParams {
    /// Params with only the type and arguments set.
    pub fn new(agent_type: AgentType, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            agent_type,
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            text_files: BTreeMap::new(),
            redact_words: Vec::new(),
            template_left_delim: None,
            template_right_delim: None,
        }
    }
}

/// Parameters of a built-in agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltinParams {
    pub agent_type: AgentType,
    /// Connection string template.
    #[serde(default)]
    pub dsn: String,
    #[serde(default)]
    pub text_files: BTreeMap<String, String>,
    #[serde(default)]
    pub max_query_length: i32,
    #[serde(default)]
    pub max_query_log_size: i64,
    #[serde(default)]
    pub disable_query_examples: bool,
    #[serde(default)]
    pub disable_comments_parsing: bool,
    #[serde(default)]
    pub tls_skip_verify: bool,
}

impl BuiltinParams {
    /// Params with only the type and DSN set.
    pub fn new(agent_type: AgentType, dsn: impl Into<String>) -> Self {
        Self {
            agent_type,
            dsn: dsn.into(),
            text_files: BTreeMap::new(),
            max_query_length: 0,
            max_query_log_size: 0,
            disable_query_examples: false,
            disable_comments_parsing: false,
            tls_skip_verify: false,
        }
    }
}

/// Complete desired state pushed by the server.
///
/// Any running agent absent from both maps is stopped.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesiredState {
    pub agent_processes: HashMap<String, ProcessParams>,
    pub builtin_agents: HashMap<String, BuiltinParams>,
}
