// src/dag/mod.rs

//! DAG representation and scheduling.
//!
//! - [`graph`] holds the validated directed acyclic graph of tasks.
//! - [`task`] defines Task Definitions and the retry policy.
//! - [`instance`] holds the Task Instance model and its state machine.
//! - [`store`] persists instances with compare-and-set transitions.
//! - [`scheduler`] decides which instances of a Run are ready, failed or
//!   due for a retry.
//! - [`scheduler_step`] defines the result type for scheduler steps.

pub mod graph;
pub mod instance;
pub mod scheduler;
pub mod scheduler_step;
pub mod store;
pub mod task;

pub use graph::DagGraph;
pub use instance::{InstanceKey, ScheduledInstance, TaskInstance, TaskState};
pub use scheduler::Scheduler;
pub use scheduler_step::{SchedulerStep, TerminalChange};
pub use store::InstanceStore;
pub use task::{RetryPolicy, TaskDefinition, TaskId};
