// src/exec/backend.rs

//! Pluggable executor backend abstraction.
//!
//! The runtime talks to an `ExecutorBackend` instead of running operators
//! itself. This makes it easy to swap in a fake executor in tests while
//! keeping the production executor in [`super::worker`].
//!
//! - `OperatorExecutor` is the default implementation used by `batchdag`. It
//!   hands every scheduled instance to the shared [`WorkerPool`].
//! - Tests can provide their own `ExecutorBackend` that, for example, records
//!   which instances were scheduled and directly emits `InstanceFinished`
//!   events with canned results.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::dag::ScheduledInstance;
use crate::engine::RunEvent;
use crate::errors::Result;

use super::worker::WorkerPool;

/// Trait abstracting how scheduled instances are executed.
///
/// Implementations must eventually send exactly one
/// [`RunEvent::InstanceFinished`] per instance they accept.
pub trait ExecutorBackend: Send {
    /// Dispatch the given instances for execution.
    ///
    /// Must return promptly; the operator work itself happens elsewhere.
    fn spawn_ready_tasks(
        &mut self,
        tasks: Vec<ScheduledInstance>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Executor backend that runs the real operators.
pub struct OperatorExecutor {
    pool: WorkerPool,
    runtime_tx: mpsc::Sender<RunEvent>,
}

impl OperatorExecutor {
    /// Create a backend that reports completions to `runtime_tx`.
    pub fn new(pool: WorkerPool, runtime_tx: mpsc::Sender<RunEvent>) -> Self {
        Self { pool, runtime_tx }
    }
}

impl ExecutorBackend for OperatorExecutor {
    fn spawn_ready_tasks(
        &mut self,
        tasks: Vec<ScheduledInstance>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let pool = self.pool.clone();
        let tx = self.runtime_tx.clone();

        Box::pin(async move {
            for task in tasks {
                pool.spawn(task, tx.clone());
            }
            Ok(())
        })
    }
}
