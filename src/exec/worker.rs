// src/exec/worker.rs

//! Bounded worker pool running operators off the dispatch loop.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connections::ConnectionProvider;
use crate::dag::ScheduledInstance;
use crate::engine::RunEvent;
use crate::errors::OperatorError;
use crate::operators::{ExecutionContext, Operator, OperatorResult};
use crate::warehouse::TableLocks;

/// Shared pool of operator workers.
///
/// Operators block on warehouse and object-store IO, so each one runs on
/// Tokio's blocking thread pool. A semaphore caps how many run at once
/// across every Run sharing the pool. The per-table write locks live here
/// too, so two Runs of a backfill never write the same table concurrently.
#[derive(Clone)]
pub struct WorkerPool {
    connections: Arc<dyn ConnectionProvider>,
    locks: Arc<TableLocks>,
    permits: Arc<Semaphore>,
    workers: usize,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .field("available", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn new(connections: Arc<dyn ConnectionProvider>, workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            connections,
            locks: Arc::new(TableLocks::new()),
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    /// Run one instance in the background and report its result on
    /// `runtime_tx`.
    pub fn spawn(&self, instance: ScheduledInstance, runtime_tx: mpsc::Sender<RunEvent>) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let task_id = instance.key.task_id.clone();
            let attempt = instance.attempt;
            let result = pool.execute(instance).await;

            if runtime_tx
                .send(RunEvent::InstanceFinished {
                    task_id: task_id.clone(),
                    attempt,
                    result,
                })
                .await
                .is_err()
            {
                warn!(task = %task_id, attempt, "run loop gone; dropping instance result");
            }
        })
    }

    async fn execute(&self, instance: ScheduledInstance) -> OperatorResult {
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(p) => p,
            Err(_) => return Err(OperatorError::Permanent("worker pool closed".to_string())),
        };

        let connections = Arc::clone(&self.connections);
        let locks = Arc::clone(&self.locks);
        let key = instance.key.clone();

        info!(
            task = %key.task_id,
            logical_date = %key.logical_date,
            attempt = instance.attempt,
            operator = instance.task.operator.kind_name(),
            "starting task instance"
        );
        let started = Instant::now();

        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let ctx = ExecutionContext {
                task_id: &instance.key.task_id,
                logical_date: instance.key.logical_date,
                attempt: instance.attempt,
                connections: connections.as_ref(),
                locks: locks.as_ref(),
            };
            instance.task.operator.execute(&ctx)
        })
        .await;

        let result = match joined {
            Ok(result) => result,
            Err(err) => {
                error!(task = %key.task_id, error = %err, "operator panicked");
                Err(OperatorError::Permanent(format!("operator panicked: {err}")))
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(completion) => debug!(
                task = %key.task_id,
                logical_date = %key.logical_date,
                ?completion,
                elapsed_ms,
                "operator finished"
            ),
            Err(err) => debug!(
                task = %key.task_id,
                logical_date = %key.logical_date,
                error = %err,
                elapsed_ms,
                "operator failed"
            ),
        }
        result
    }
}
