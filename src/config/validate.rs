// src/config/validate.rs

use std::collections::HashSet;
use std::time::Duration;

use crate::config::model::{
    parse_duration, ConfigFile, ConnectionConfig, OperatorConfig, RawConfigFile, TaskConfig,
};
use crate::dag::{DagGraph, RetryPolicy, TaskDefinition};
use crate::errors::{BatchdagError, Result};
use crate::operators::{
    template, DataQualityOperator, LoadOperator, OperatorRegistry, OperatorSpec, QualityCheck,
    StageOperator,
};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = BatchdagError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_tasks(cfg)?;
    validate_dag_section(cfg)?;
    validate_scheduler(cfg)?;
    for task in &cfg.task {
        validate_task(cfg, task)?;
    }
    Ok(())
}

fn config_error(msg: impl Into<String>) -> BatchdagError {
    BatchdagError::ConfigError(msg.into())
}

fn ensure_has_tasks(cfg: &RawConfigFile) -> Result<()> {
    if cfg.task.is_empty() {
        return Err(config_error("config must contain at least one [[task]] entry"));
    }
    Ok(())
}

fn validate_dag_section(cfg: &RawConfigFile) -> Result<()> {
    if cfg.dag.id.trim().is_empty() {
        return Err(config_error("[dag].id must not be empty"));
    }
    Ok(())
}

fn validate_scheduler(cfg: &RawConfigFile) -> Result<()> {
    if cfg.scheduler.workers == 0 {
        return Err(config_error("[scheduler].workers must be >= 1 (got 0)"));
    }
    parse_duration(&cfg.scheduler.retry_delay)
        .map_err(|e| config_error(format!("[scheduler].retry_delay: {e}")))?;
    if cfg.scheduler.state_db.trim().is_empty() {
        return Err(config_error("[scheduler].state_db must not be empty"));
    }
    Ok(())
}

fn validate_task(cfg: &RawConfigFile, task: &TaskConfig) -> Result<()> {
    let id = &task.id;
    if id.trim().is_empty() {
        return Err(config_error("task id must not be empty"));
    }
    if let Some(delay) = &task.retry_delay {
        parse_duration(delay).map_err(|e| config_error(format!("task '{id}' retry_delay: {e}")))?;
    }

    let require = |field: &str, value: &str| -> Result<()> {
        if value.trim().is_empty() {
            return Err(config_error(format!("task '{id}': `{field}` must not be empty")));
        }
        Ok(())
    };
    let placeholders = |field: &str, value: &str| -> Result<()> {
        match template::unknown_placeholder(value) {
            Some(name) => Err(config_error(format!(
                "task '{id}': unknown placeholder '{{{name}}}' in `{field}`; expected one of {:?}",
                template::PLACEHOLDERS
            ))),
            None => Ok(()),
        }
    };
    let warehouse = |name: &str| -> Result<()> {
        match cfg.connections.get(name) {
            Some(ConnectionConfig::Sqlite { .. }) => Ok(()),
            Some(_) => Err(config_error(format!(
                "task '{id}': connection '{name}' is not a warehouse connection"
            ))),
            None => Err(config_error(format!("task '{id}': unknown connection '{name}'"))),
        }
    };

    match &task.operator {
        OperatorConfig::Stage {
            table,
            source,
            source_conn,
            warehouse_conn,
            partition_column,
            ..
        } => {
            require("table", table)?;
            require("source", source)?;
            require("partition_column", partition_column)?;
            placeholders("source", source)?;
            warehouse(warehouse_conn)?;
            match cfg.connections.get(source_conn) {
                Some(ConnectionConfig::Local { .. }) => {}
                Some(_) => {
                    return Err(config_error(format!(
                        "task '{id}': connection '{source_conn}' is not an object-store connection"
                    )));
                }
                None => {
                    return Err(config_error(format!(
                        "task '{id}': unknown connection '{source_conn}'"
                    )));
                }
            }
        }
        OperatorConfig::LoadFact {
            table,
            sql,
            warehouse_conn,
            partition_column,
            ..
        }
        | OperatorConfig::LoadDimension {
            table,
            sql,
            warehouse_conn,
            partition_column,
            ..
        } => {
            require("table", table)?;
            require("sql", sql)?;
            placeholders("sql", sql)?;
            if let Some(col) = partition_column {
                require("partition_column", col)?;
            }
            warehouse(warehouse_conn)?;
        }
        OperatorConfig::DataQuality {
            warehouse_conn,
            checks,
        } => {
            if checks.is_empty() {
                return Err(config_error(format!(
                    "task '{id}': data_quality needs at least one [[task.checks]] entry"
                )));
            }
            let mut names = HashSet::new();
            for check in checks {
                require("checks.name", &check.name)?;
                require("checks.sql", &check.sql)?;
                placeholders("checks.sql", &check.sql)?;
                if !names.insert(check.name.as_str()) {
                    return Err(config_error(format!(
                        "task '{id}': duplicate quality check name '{}'",
                        check.name
                    )));
                }
                if check.expected_value().is_none() {
                    return Err(config_error(format!(
                        "task '{id}': check '{}' expected value must be an integer, float, boolean or string",
                        check.name
                    )));
                }
            }
            warehouse(warehouse_conn)?;
        }
        OperatorConfig::Custom { callback } => {
            require("callback", callback)?;
        }
    }

    Ok(())
}

impl ConfigFile {
    /// DAG-wide retry policy from `[scheduler]`.
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        let delay = self.duration(&self.scheduler.retry_delay, "[scheduler].retry_delay")?;
        Ok(RetryPolicy::new(self.scheduler.max_retries, delay))
    }

    fn duration(&self, s: &str, what: &str) -> Result<Duration> {
        parse_duration(s).map_err(|e| config_error(format!("{what}: {e}")))
    }

    /// Turn every `[[task]]` into a Task Definition, in declaration order.
    ///
    /// Custom callbacks are looked up in `registry`; an unknown name is a
    /// configuration error.
    pub fn task_definitions(&self, registry: &OperatorRegistry) -> Result<Vec<TaskDefinition>> {
        let default_retry = self.retry_policy()?;

        self.task
            .iter()
            .map(|task| {
                let operator = operator_spec(task, registry)?;
                let retry = RetryPolicy::new(
                    task.retries.unwrap_or(default_retry.max_retries),
                    match &task.retry_delay {
                        Some(d) => self.duration(d, &format!("task '{}' retry_delay", task.id))?,
                        None => default_retry.retry_delay,
                    },
                );
                let mut def = TaskDefinition::new(task.id.clone(), operator).with_retry(retry);
                def.upstream = task.after.clone();
                Ok(def)
            })
            .collect()
    }

    /// Build the validated DAG Graph.
    pub fn build_graph(&self, registry: &OperatorRegistry) -> Result<DagGraph> {
        let definitions = self.task_definitions(registry)?;
        Ok(DagGraph::new(self.dag.id.clone(), definitions)?)
    }
}

fn operator_spec(task: &TaskConfig, registry: &OperatorRegistry) -> Result<OperatorSpec> {
    let spec = match &task.operator {
        OperatorConfig::Stage {
            table,
            source,
            source_conn,
            warehouse_conn,
            partition_column,
            skip_if_empty,
        } => OperatorSpec::Stage(StageOperator {
            table: table.clone(),
            source: source.clone(),
            source_conn: source_conn.clone(),
            warehouse_conn: warehouse_conn.clone(),
            partition_column: partition_column.clone(),
            skip_if_empty: *skip_if_empty,
        }),
        OperatorConfig::LoadFact {
            table,
            sql,
            mode,
            warehouse_conn,
            columns,
            partition_column,
        } => OperatorSpec::LoadFact(LoadOperator {
            table: table.clone(),
            sql: sql.clone(),
            mode: *mode,
            warehouse_conn: warehouse_conn.clone(),
            columns: columns.clone(),
            partition_column: partition_column.clone(),
        }),
        OperatorConfig::LoadDimension {
            table,
            sql,
            mode,
            warehouse_conn,
            columns,
            partition_column,
        } => OperatorSpec::LoadDimension(LoadOperator {
            table: table.clone(),
            sql: sql.clone(),
            mode: *mode,
            warehouse_conn: warehouse_conn.clone(),
            columns: columns.clone(),
            partition_column: partition_column.clone(),
        }),
        OperatorConfig::DataQuality {
            warehouse_conn,
            checks,
        } => OperatorSpec::DataQuality(DataQualityOperator {
            warehouse_conn: warehouse_conn.clone(),
            checks: checks
                .iter()
                .map(|c| {
                    Ok(QualityCheck {
                        name: c.name.clone(),
                        sql: c.sql.clone(),
                        expected: c.expected_value().ok_or_else(|| {
                            config_error(format!("check '{}' has an unsupported expected value", c.name))
                        })?,
                        comparison: c.comparison,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        }),
        OperatorConfig::Custom { callback } => {
            let op = registry.custom(callback).ok_or_else(|| {
                config_error(format!(
                    "task '{}': no custom operator registered as '{callback}'",
                    task.id
                ))
            })?;
            OperatorSpec::Custom(op.clone())
        }
    };
    Ok(spec)
}
