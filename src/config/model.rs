// src/config/model.rs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::Deserialize;

use crate::operators::LoadMode;
use crate::warehouse::SqlValue;
use crate::operators::Comparison;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [dag]
/// id = "sparkify"
/// start_date = "2018-11-01"
///
/// [scheduler]
/// max_retries = 3
/// retry_delay = "5m"
/// workers = 4
///
/// [connections.warehouse]
/// kind = "sqlite"
/// path = "warehouse.db"
///
/// [connections.object-store]
/// kind = "local"
/// root = "data"
///
/// [[task]]
/// id = "stage_events"
/// operator = "stage"
/// table = "staging_events"
/// source = "log_data/{year}/{month}/{day}/"
/// ```
///
/// Everything except `[dag]` and at least one `[[task]]` has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    pub dag: DagSection,

    #[serde(default)]
    pub scheduler: SchedulerSection,

    /// Symbolic connection name -> how to open it.
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionConfig>,

    /// Tasks in declaration order (the topological tie-break order).
    #[serde(default)]
    pub task: Vec<TaskConfig>,
}

/// Validated configuration. Only obtainable through
/// `ConfigFile::try_from(RawConfigFile)`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub dag: DagSection,
    pub scheduler: SchedulerSection,
    pub connections: BTreeMap<String, ConnectionConfig>,
    pub task: Vec<TaskConfig>,
    /// Directory relative paths resolve against.
    pub base_dir: PathBuf,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self {
            dag: raw.dag,
            scheduler: raw.scheduler,
            connections: raw.connections,
            task: raw.task,
            base_dir: PathBuf::from("."),
        }
    }

    /// Resolve relative paths against `dir` instead of the working directory.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    /// Absolute-or-relative location of the instance store; `None` means
    /// in-memory.
    pub fn state_db_path(&self) -> Option<PathBuf> {
        if self.scheduler.state_db == ":memory:" {
            None
        } else {
            Some(resolve(&self.base_dir, &self.scheduler.state_db))
        }
    }
}

pub(crate) fn resolve(base: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() { p.to_path_buf() } else { base.join(p) }
}

/// `[dag]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DagSection {
    pub id: String,

    #[serde(default)]
    pub description: Option<String>,

    /// First logical date `run --catchup` considers.
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between a failure and the next attempt (`"5m"`, `"30s"`).
    #[serde(default = "default_retry_delay")]
    pub retry_delay: String,

    /// Worker pool size; also caps concurrently running instances per Run.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// SQLite file holding Task Instance state, or `":memory:"`.
    #[serde(default = "default_state_db")]
    pub state_db: String,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> String {
    "5m".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_state_db() -> String {
    ".batchdag/state.db".to_string()
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            workers: default_workers(),
            state_db: default_state_db(),
        }
    }
}

/// `[connections.<name>]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum ConnectionConfig {
    /// SQLite database acting as the warehouse.
    Sqlite {
        path: String,
        #[serde(default = "default_pool_size")]
        pool_size: usize,
    },
    /// Object store rooted at a local directory.
    Local { root: String },
}

fn default_pool_size() -> usize {
    4
}

/// One `[[task]]` entry.
///
/// Deserialized in two halves: the keys shared by every task, then the
/// remaining table as the tagged [`OperatorConfig`]. Unknown keys are
/// rejected in either half.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "toml::Table")]
pub struct TaskConfig {
    pub id: String,

    /// Dependency list: this task waits for all tasks listed here.
    pub after: Vec<String>,

    /// Overrides `[scheduler].max_retries` for this task.
    pub retries: Option<u32>,

    /// Overrides `[scheduler].retry_delay` for this task.
    pub retry_delay: Option<String>,

    pub operator: OperatorConfig,
}

/// Keys every `[[task]]` may carry regardless of its operator.
const TASK_KEYS: &[&str] = &["id", "after", "retries", "retry_delay"];

#[derive(Deserialize)]
struct TaskHead {
    id: String,
    #[serde(default)]
    after: Vec<String>,
    #[serde(default)]
    retries: Option<u32>,
    #[serde(default)]
    retry_delay: Option<String>,
}

impl TryFrom<toml::Table> for TaskConfig {
    type Error = String;

    fn try_from(mut table: toml::Table) -> Result<Self, Self::Error> {
        let mut head = toml::Table::new();
        for key in TASK_KEYS {
            if let Some(value) = table.remove(*key) {
                head.insert((*key).to_string(), value);
            }
        }

        let head: TaskHead = toml::Value::Table(head)
            .try_into()
            .map_err(|e: toml::de::Error| format!("[[task]]: {}", e.message()))?;
        let operator: OperatorConfig = toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| format!("task '{}': {}", head.id, e.message()))?;

        Ok(TaskConfig {
            id: head.id,
            after: head.after,
            retries: head.retries,
            retry_delay: head.retry_delay,
            operator,
        })
    }
}

/// Operator-specific fields, selected by `operator = "..."`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operator", rename_all = "snake_case", deny_unknown_fields)]
pub enum OperatorConfig {
    Stage {
        table: String,
        source: String,
        #[serde(default = "default_source_conn")]
        source_conn: String,
        #[serde(default = "default_warehouse_conn")]
        warehouse_conn: String,
        #[serde(default = "default_partition_column")]
        partition_column: String,
        #[serde(default)]
        skip_if_empty: bool,
    },
    LoadFact {
        table: String,
        sql: String,
        #[serde(default = "default_fact_mode")]
        mode: LoadMode,
        #[serde(default = "default_warehouse_conn")]
        warehouse_conn: String,
        #[serde(default)]
        columns: Vec<String>,
        #[serde(default)]
        partition_column: Option<String>,
    },
    LoadDimension {
        table: String,
        sql: String,
        #[serde(default = "default_dimension_mode")]
        mode: LoadMode,
        #[serde(default = "default_warehouse_conn")]
        warehouse_conn: String,
        #[serde(default)]
        columns: Vec<String>,
        #[serde(default)]
        partition_column: Option<String>,
    },
    DataQuality {
        #[serde(default = "default_warehouse_conn")]
        warehouse_conn: String,
        #[serde(default)]
        checks: Vec<CheckConfig>,
    },
    Custom {
        /// Name of a callback registered in the `OperatorRegistry`.
        callback: String,
    },
}

impl OperatorConfig {
    pub fn kind_name(&self) -> &'static str {
        match self {
            OperatorConfig::Stage { .. } => "stage",
            OperatorConfig::LoadFact { .. } => "load_fact",
            OperatorConfig::LoadDimension { .. } => "load_dimension",
            OperatorConfig::DataQuality { .. } => "data_quality",
            OperatorConfig::Custom { .. } => "custom",
        }
    }
}

/// `[[task.checks]]` entry of a `data_quality` task.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckConfig {
    pub name: String,
    pub sql: String,
    /// Integer, float or string.
    pub expected: toml::Value,
    #[serde(default)]
    pub comparison: Comparison,
}

impl CheckConfig {
    pub(crate) fn expected_value(&self) -> Option<SqlValue> {
        match &self.expected {
            toml::Value::Integer(i) => Some(SqlValue::Integer(*i)),
            toml::Value::Float(f) => Some(SqlValue::Real(*f)),
            toml::Value::String(s) => Some(SqlValue::Text(s.clone())),
            toml::Value::Boolean(b) => Some(SqlValue::Integer(i64::from(*b))),
            _ => None,
        }
    }
}

fn default_source_conn() -> String {
    "object-store".to_string()
}

fn default_warehouse_conn() -> String {
    "warehouse".to_string()
}

fn default_partition_column() -> String {
    "partition_key".to_string()
}

fn default_fact_mode() -> LoadMode {
    LoadMode::Append
}

fn default_dimension_mode() -> LoadMode {
    LoadMode::TruncateInsert
}

/// Parse durations like `"500ms"`, `"30s"`, `"5m"`, `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    // Find the boundary between digits and suffix.
    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{num_part}': {e}"))?;

    let secs_per_unit = match unit_part.trim().to_lowercase().as_str() {
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        unit => {
            return Err(format!(
                "unsupported duration unit '{unit}'; expected ms, s, m, or h"
            ));
        }
    };
    value
        .checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{s}' too large"))
}
