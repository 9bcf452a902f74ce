#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use batchdag::config::{
    CheckConfig, ConfigFile, ConnectionConfig, DagSection, OperatorConfig, RawConfigFile,
    SchedulerSection, TaskConfig,
};
use batchdag::connections::{ConnectionProvider, ConnectionRegistry};
use batchdag::dag::{DagGraph, InstanceStore, RetryPolicy, TaskDefinition};
use batchdag::engine::Pipeline;
use batchdag::operators::{Completion, CustomOperator, ExecutionContext, OperatorResult, OperatorSpec};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new(dag_id: &str) -> Self {
        Self {
            config: RawConfigFile {
                dag: DagSection {
                    id: dag_id.to_string(),
                    description: None,
                    start_date: None,
                },
                scheduler: SchedulerSection {
                    state_db: ":memory:".to_string(),
                    ..SchedulerSection::default()
                },
                connections: BTreeMap::new(),
                task: Vec::new(),
            },
        }
    }

    pub fn with_task(mut self, task: TaskConfig) -> Self {
        self.config.task.push(task);
        self
    }

    pub fn with_connection(mut self, name: &str, conn: ConnectionConfig) -> Self {
        self.config.connections.insert(name.to_string(), conn);
        self
    }

    /// In-memory `warehouse` and a local `object-store` rooted at `root`.
    pub fn with_default_connections(self, root: &str) -> Self {
        self.with_connection(
            "warehouse",
            ConnectionConfig::Sqlite {
                path: ":memory:".to_string(),
                pool_size: 1,
            },
        )
        .with_connection(
            "object-store",
            ConnectionConfig::Local {
                root: root.to_string(),
            },
        )
    }

    pub fn retries(mut self, max_retries: u32, retry_delay: &str) -> Self {
        self.config.scheduler.max_retries = max_retries;
        self.config.scheduler.retry_delay = retry_delay.to_string();
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.scheduler.workers = workers;
        self
    }

    pub fn state_db(mut self, path: &str) -> Self {
        self.config.scheduler.state_db = path.to_string();
        self
    }

    pub fn build_raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

/// Builder for `TaskConfig`.
pub struct TaskConfigBuilder {
    task: TaskConfig,
}

impl TaskConfigBuilder {
    fn with_operator(id: &str, operator: OperatorConfig) -> Self {
        Self {
            task: TaskConfig {
                id: id.to_string(),
                after: vec![],
                retries: None,
                retry_delay: None,
                operator,
            },
        }
    }

    pub fn custom(id: &str, callback: &str) -> Self {
        Self::with_operator(
            id,
            OperatorConfig::Custom {
                callback: callback.to_string(),
            },
        )
    }

    pub fn stage(id: &str, table: &str, source: &str) -> Self {
        Self::with_operator(
            id,
            OperatorConfig::Stage {
                table: table.to_string(),
                source: source.to_string(),
                source_conn: "object-store".to_string(),
                warehouse_conn: "warehouse".to_string(),
                partition_column: "partition_key".to_string(),
                skip_if_empty: false,
            },
        )
    }

    pub fn load_fact(id: &str, table: &str, sql: &str) -> Self {
        Self::with_operator(
            id,
            OperatorConfig::LoadFact {
                table: table.to_string(),
                sql: sql.to_string(),
                mode: batchdag::operators::LoadMode::Append,
                warehouse_conn: "warehouse".to_string(),
                columns: vec![],
                partition_column: None,
            },
        )
    }

    pub fn data_quality(id: &str, checks: Vec<CheckConfig>) -> Self {
        Self::with_operator(
            id,
            OperatorConfig::DataQuality {
                warehouse_conn: "warehouse".to_string(),
                checks,
            },
        )
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.task.after.push(dep.to_string());
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.task.retries = Some(retries);
        self
    }

    pub fn retry_delay(mut self, delay: &str) -> Self {
        self.task.retry_delay = Some(delay.to_string());
        self
    }

    pub fn build(self) -> TaskConfig {
        self.task
    }
}

/// Task whose operator always succeeds.
pub fn noop_task(id: &str) -> TaskDefinition {
    callback_task(id, |_| Ok(Completion::Done))
}

/// Task running `f` as its operator.
pub fn callback_task(
    id: &str,
    f: impl Fn(&ExecutionContext<'_>) -> OperatorResult + Send + Sync + 'static,
) -> TaskDefinition {
    TaskDefinition::new(id, OperatorSpec::Custom(CustomOperator::new(id, f)))
}

/// Retry policy with a delay short enough for async tests.
pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries, Duration::from_millis(10))
}

/// Pipeline over an in-memory state store.
pub fn memory_pipeline(
    dag_id: &str,
    tasks: Vec<TaskDefinition>,
    connections: ConnectionRegistry,
    workers: usize,
) -> Pipeline {
    let graph = DagGraph::new(dag_id, tasks).expect("valid test DAG");
    let store = Arc::new(InstanceStore::open_in_memory().expect("in-memory state store"));
    let connections: Arc<dyn ConnectionProvider> = Arc::new(connections);
    Pipeline::new(graph, store, connections, workers)
}
