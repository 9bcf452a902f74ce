// src/operators/stage.rs

//! Stage one object-storage partition into a staging table.
//!
//! Idempotency: rows are keyed by a partition column holding the logical
//! date (`{ds}`). Each execution deletes that partition's rows and inserts the
//! freshly read records inside a single warehouse transaction, so repeated
//! invocations for the same date converge on the same table state.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::errors::OperatorError;
use crate::warehouse::{quote_ident, SqlValue, Statement};

use super::template;
use super::{Completion, ExecutionContext, Operator, OperatorResult};

const RECORD_EXTENSIONS: &[&str] = &[".json", ".jsonl", ".ndjson"];

#[derive(Debug, Clone)]
pub struct StageOperator {
    /// Target staging table.
    pub table: String,
    /// Source location template, e.g. `log_data/{year}/{month}/{day}/`.
    pub source: String,
    pub source_conn: String,
    pub warehouse_conn: String,
    /// Column receiving the logical date; scopes the delete-then-insert.
    pub partition_column: String,
    /// Report SKIPPED instead of loading zero rows when the partition is empty.
    pub skip_if_empty: bool,
}

impl StageOperator {
    fn read_records(
        &self,
        ctx: &ExecutionContext<'_>,
        prefix: &str,
    ) -> Result<Vec<Map<String, Value>>, OperatorError> {
        let store = ctx.connections.object_store(&self.source_conn)?;
        let keys = store.list(prefix)?;

        let mut records = Vec::new();
        for key in keys
            .iter()
            .filter(|k| RECORD_EXTENSIONS.iter().any(|ext| k.ends_with(ext)))
        {
            let bytes = store.get(key)?;
            let text = String::from_utf8(bytes).map_err(|e| {
                OperatorError::Permanent(format!("object '{key}' is not valid UTF-8: {e}"))
            })?;

            for (line_no, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let record: Map<String, Value> = serde_json::from_str(line).map_err(|e| {
                    OperatorError::Permanent(format!(
                        "malformed record in '{key}' line {}: {e}",
                        line_no + 1
                    ))
                })?;
                records.push(record);
            }
            debug!(task = ctx.task_id, key = %key, total = records.len(), "read source object");
        }

        Ok(records)
    }

    fn build_statements(
        &self,
        columns: &[String],
        partition_key: &str,
        records: &[Map<String, Value>],
    ) -> Vec<Statement> {
        // lower-cased JSON key -> table column
        let lookup: HashMap<String, &str> = columns
            .iter()
            .filter(|c| !c.eq_ignore_ascii_case(&self.partition_column))
            .map(|c| (c.to_lowercase(), c.as_str()))
            .collect();

        let table = quote_ident(&self.table);
        let partition_col = quote_ident(&self.partition_column);

        let mut statements = Vec::with_capacity(records.len() + 1);
        statements.push(Statement::with_params(
            format!("DELETE FROM {table} WHERE {partition_col} = ?1"),
            vec![SqlValue::from(partition_key)],
        ));

        for record in records {
            let mut names = vec![partition_col.clone()];
            let mut params = vec![SqlValue::from(partition_key)];
            for (key, value) in record {
                if let Some(column) = lookup.get(&key.to_lowercase()) {
                    names.push(quote_ident(column));
                    params.push(SqlValue::from_json(value));
                }
            }
            let placeholders = (1..=params.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            statements.push(Statement::with_params(
                format!("INSERT INTO {table} ({}) VALUES ({placeholders})", names.join(", ")),
                params,
            ));
        }

        statements
    }
}

impl Operator for StageOperator {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> OperatorResult {
        let prefix = template::render(&self.source, ctx.logical_date);
        let partition_key = ctx.logical_date.format("%Y-%m-%d").to_string();

        info!(
            task = ctx.task_id,
            logical_date = %ctx.logical_date,
            table = %self.table,
            prefix = %prefix,
            "staging partition"
        );

        let records = self.read_records(ctx, &prefix)?;
        if records.is_empty() {
            if self.skip_if_empty {
                return Ok(Completion::Skipped(format!("no records under '{prefix}'")));
            }
            warn!(task = ctx.task_id, prefix = %prefix, "partition is empty; clearing staged rows only");
        }

        let warehouse = ctx.connections.warehouse(&self.warehouse_conn)?;
        let columns = warehouse.table_columns(&self.table)?;
        if columns.is_empty() {
            return Err(OperatorError::Permanent(format!(
                "staging table '{}' does not exist",
                self.table
            )));
        }
        if !columns
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&self.partition_column))
        {
            return Err(OperatorError::Permanent(format!(
                "staging table '{}' has no partition column '{}'",
                self.table, self.partition_column
            )));
        }

        let statements = self.build_statements(&columns, &partition_key, &records);
        let affected = ctx
            .locks
            .with_table(&self.table, || warehouse.execute_atomic(&statements))?;

        info!(
            task = ctx.task_id,
            table = %self.table,
            rows = records.len(),
            affected,
            "staged partition"
        );
        Ok(Completion::Done)
    }
}
