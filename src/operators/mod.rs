// src/operators/mod.rs

//! Operator contract and the closed set of concrete operators.
//!
//! Every operator exposes a single blocking `execute` for one logical run
//! date. Implementations must be idempotent for a given date (retries and
//! backfills re-invoke them) and must either finish completely or leave the
//! warehouse exactly as it was.
//!
//! - [`stage`]: object storage partition → staging table (delete-then-insert).
//! - [`load`]: SQL transformation → fact / dimension table.
//! - [`quality`]: ordered quality checks gating downstream work.
//! - [`OperatorSpec::Custom`]: named callback from an [`OperatorRegistry`].

pub mod load;
pub mod quality;
pub mod stage;
pub mod template;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;

use crate::connections::ConnectionProvider;
use crate::errors::OperatorError;
use crate::warehouse::TableLocks;

pub use load::{LoadMode, LoadOperator};
pub use quality::{Comparison, DataQualityOperator, QualityCheck};
pub use stage::StageOperator;

/// Successful completion of an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Done,
    /// Nothing to do for this date; downstream still proceeds.
    Skipped(String),
}

pub type OperatorResult = Result<Completion, OperatorError>;

/// Everything an operator may touch while executing.
pub struct ExecutionContext<'a> {
    pub task_id: &'a str,
    pub logical_date: NaiveDate,
    /// 1-based attempt number (retry_count + 1).
    pub attempt: u32,
    pub connections: &'a dyn ConnectionProvider,
    pub locks: &'a TableLocks,
}

/// The uniform interface every task implementation satisfies.
pub trait Operator {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> OperatorResult;
}

type Callback = dyn Fn(&ExecutionContext<'_>) -> OperatorResult + Send + Sync;

/// Named, user-supplied operator.
#[derive(Clone)]
pub struct CustomOperator {
    pub name: String,
    callback: Arc<Callback>,
}

impl CustomOperator {
    pub fn new(
        name: impl Into<String>,
        callback: impl Fn(&ExecutionContext<'_>) -> OperatorResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            callback: Arc::new(callback),
        }
    }
}

impl fmt::Debug for CustomOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomOperator")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Operator for CustomOperator {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> OperatorResult {
        (self.callback)(ctx)
    }
}

/// Closed set of operator kinds a Task Definition can carry.
#[derive(Debug, Clone)]
pub enum OperatorSpec {
    Stage(StageOperator),
    LoadFact(LoadOperator),
    LoadDimension(LoadOperator),
    DataQuality(DataQualityOperator),
    Custom(CustomOperator),
}

impl OperatorSpec {
    pub fn kind_name(&self) -> &'static str {
        match self {
            OperatorSpec::Stage(_) => "stage",
            OperatorSpec::LoadFact(_) => "load_fact",
            OperatorSpec::LoadDimension(_) => "load_dimension",
            OperatorSpec::DataQuality(_) => "data_quality",
            OperatorSpec::Custom(_) => "custom",
        }
    }
}

impl Operator for OperatorSpec {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> OperatorResult {
        match self {
            OperatorSpec::Stage(op) => op.execute(ctx),
            OperatorSpec::LoadFact(op) | OperatorSpec::LoadDimension(op) => op.execute(ctx),
            OperatorSpec::DataQuality(op) => op.execute(ctx),
            OperatorSpec::Custom(op) => op.execute(ctx),
        }
    }
}

/// Custom operators available to `operator = "custom"` tasks by name.
///
/// `noop` is always registered; it is what start/end marker tasks use.
#[derive(Debug, Clone)]
pub struct OperatorRegistry {
    custom: HashMap<String, CustomOperator>,
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        let mut registry = Self {
            custom: HashMap::new(),
        };
        registry.register(CustomOperator::new("noop", |_| Ok(Completion::Done)));
        registry
    }
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, op: CustomOperator) -> &mut Self {
        self.custom.insert(op.name.clone(), op);
        self
    }

    pub fn custom(&self, name: &str) -> Option<&CustomOperator> {
        self.custom.get(name)
    }
}
