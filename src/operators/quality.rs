// src/operators/quality.rs

//! Data-quality gate.
//!
//! Checks run in declaration order; the first failing check stops evaluation
//! and fails the task with the check's name and observed/expected values.
//! Nothing here writes to the warehouse.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::OperatorError;
use crate::warehouse::SqlValue;

use super::template;
use super::{Completion, ExecutionContext, Operator, OperatorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    #[default]
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparison {
    pub fn holds(&self, observed: &SqlValue, expected: &SqlValue) -> bool {
        match observed.compare(expected) {
            Some(ord) => match self {
                Comparison::Eq => ord == Ordering::Equal,
                Comparison::Ne => ord != Ordering::Equal,
                Comparison::Gt => ord == Ordering::Greater,
                Comparison::Ge => ord != Ordering::Less,
                Comparison::Lt => ord == Ordering::Less,
                Comparison::Le => ord != Ordering::Greater,
            },
            // Incomparable (NULL vs value, text vs number) only satisfies `ne`.
            None => *self == Comparison::Ne,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
        })
    }
}

/// A SQL predicate paired with its expected result.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityCheck {
    pub name: String,
    pub sql: String,
    pub expected: SqlValue,
    pub comparison: Comparison,
}

impl QualityCheck {
    /// `SELECT COUNT(*) ...` must equal `expected`.
    pub fn count_equals(name: impl Into<String>, sql: impl Into<String>, expected: i64) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            expected: SqlValue::Integer(expected),
            comparison: Comparison::Eq,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DataQualityOperator {
    pub checks: Vec<QualityCheck>,
    pub warehouse_conn: String,
}

impl Operator for DataQualityOperator {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> OperatorResult {
        let warehouse = ctx.connections.warehouse(&self.warehouse_conn)?;

        for check in &self.checks {
            let sql = template::render(&check.sql, ctx.logical_date);
            let observed = warehouse.query_scalar(&sql)?;
            debug!(task = ctx.task_id, check = %check.name, %observed, "quality check evaluated");

            if !check.comparison.holds(&observed, &check.expected) {
                return Err(OperatorError::QualityCheckFailed {
                    check: check.name.clone(),
                    observed,
                    expected: check.expected.clone(),
                    comparison: check.comparison,
                });
            }
        }

        info!(
            task = ctx.task_id,
            logical_date = %ctx.logical_date,
            checks = self.checks.len(),
            "all quality checks passed"
        );
        Ok(Completion::Done)
    }
}
