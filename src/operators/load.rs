// src/operators/load.rs

//! Fact and dimension loads from an externally supplied SQL transformation.

use serde::Deserialize;
use tracing::info;

use crate::warehouse::{quote_ident, SqlValue, Statement};

use super::template;
use super::{Completion, ExecutionContext, Operator, OperatorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Insert derived rows, keeping what is already there.
    Append,
    /// Replace the whole table with the transformation's result, atomically.
    TruncateInsert,
}

#[derive(Debug, Clone)]
pub struct LoadOperator {
    pub table: String,
    /// `SELECT ...` whose rows are inserted into `table`.
    pub sql: String,
    pub mode: LoadMode,
    pub warehouse_conn: String,
    /// Optional explicit insert column list.
    pub columns: Vec<String>,
    /// In append mode, delete this logical date's rows first.
    pub partition_column: Option<String>,
}

impl LoadOperator {
    pub fn statements(&self, ctx: &ExecutionContext<'_>) -> Vec<Statement> {
        let table = quote_ident(&self.table);
        let select = template::render(&self.sql, ctx.logical_date);
        let column_list = if self.columns.is_empty() {
            String::new()
        } else {
            let cols: Vec<_> = self.columns.iter().map(|c| quote_ident(c)).collect();
            format!(" ({})", cols.join(", "))
        };

        let mut statements = Vec::with_capacity(2);
        match self.mode {
            LoadMode::TruncateInsert => {
                statements.push(Statement::new(format!("DELETE FROM {table}")));
            }
            LoadMode::Append => {
                if let Some(col) = &self.partition_column {
                    statements.push(Statement::with_params(
                        format!("DELETE FROM {table} WHERE {} = ?1", quote_ident(col)),
                        vec![SqlValue::from(ctx.logical_date.format("%Y-%m-%d").to_string())],
                    ));
                }
            }
        }
        statements.push(Statement::new(format!(
            "INSERT INTO {table}{column_list} {}",
            select.trim().trim_end_matches(';')
        )));
        statements
    }
}

impl Operator for LoadOperator {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> OperatorResult {
        let warehouse = ctx.connections.warehouse(&self.warehouse_conn)?;
        let statements = self.statements(ctx);

        // The delete and the insert share one transaction: if the
        // transformation fails the previous contents survive untouched.
        let affected = ctx
            .locks
            .with_table(&self.table, || warehouse.execute_atomic(&statements))?;

        info!(
            task = ctx.task_id,
            logical_date = %ctx.logical_date,
            table = %self.table,
            mode = ?self.mode,
            affected,
            "load complete"
        );
        Ok(Completion::Done)
    }
}
