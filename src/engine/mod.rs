// src/engine/mod.rs

//! Orchestration engine for batchdag.
//!
//! This module ties together:
//! - the DAG scheduler
//! - the runtime event loop that reacts to:
//!   - instance completion events from the executor
//!   - retry timers
//!   - cancellation
//! - the Backfill Runner driving many Runs
//!
//! The pure core state machine lives in [`core`]; the async/IO shell is
//! implemented in [`runtime`].

use tokio::sync::watch;

use crate::dag::task::TaskId;
use crate::operators::OperatorResult;

/// Events flowing into the runtime of one Run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Create the Run's instances and dispatch the start tasks.
    Start,
    /// An operator attempt finished (successfully or not).
    InstanceFinished {
        task_id: TaskId,
        attempt: u32,
        result: OperatorResult,
    },
    /// Time passed; re-check retry eligibility.
    Tick,
    /// Stop dispatching; let in-flight instances finish.
    CancelRequested,
}

/// Cancellation signal shared by the Runs of one invocation.
///
/// Sending `true` cancels every Run holding a receiver.
pub fn cancel_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

pub mod backfill;
pub mod core;
pub mod outcome;
pub mod pipeline;
pub mod runtime;

pub use backfill::{BackfillMode, BackfillOptions, BackfillReport, BackfillRunner};
pub use core::{CoreCommand, CoreRuntime, CoreStep};
pub use outcome::{FailureClass, RunOutcome, RunReport};
pub use pipeline::Pipeline;
pub use runtime::Runtime;
