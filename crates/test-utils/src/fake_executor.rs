use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use batchdag::dag::ScheduledInstance;
use batchdag::engine::RunEvent;
use batchdag::errors::{OperatorError, Result};
use batchdag::exec::ExecutorBackend;
use batchdag::operators::{Completion, OperatorResult};

type Script = Arc<Mutex<HashMap<String, VecDeque<OperatorResult>>>>;

/// A fake executor that:
/// - records which instances were "run" (as `task#attempt`)
/// - immediately reports a result for each scheduled instance: the next
///   scripted result for that task, or `Done` once the script is used up.
pub struct FakeExecutor {
    runtime_tx: mpsc::Sender<RunEvent>,
    executed: Arc<Mutex<Vec<String>>>,
    script: Script,
}

impl FakeExecutor {
    pub fn new(
        runtime_tx: mpsc::Sender<RunEvent>,
        executed: Arc<Mutex<Vec<String>>>,
    ) -> Self {
        Self {
            runtime_tx,
            executed,
            script: Arc::default(),
        }
    }

    /// Queue a result for the next attempt of `task`.
    pub fn then(self, task: &str, result: OperatorResult) -> Self {
        self.script
            .lock()
            .unwrap()
            .entry(task.to_string())
            .or_default()
            .push_back(result);
        self
    }

    /// The next `times` attempts of `task` fail transiently.
    pub fn fail_transiently(mut self, task: &str, times: usize) -> Self {
        for i in 0..times {
            self = self.then(
                task,
                Err(OperatorError::Transient(format!("simulated timeout #{}", i + 1))),
            );
        }
        self
    }
}

impl ExecutorBackend for FakeExecutor {
    fn spawn_ready_tasks(
        &mut self,
        tasks: Vec<ScheduledInstance>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let tx = self.runtime_tx.clone();
        let executed = Arc::clone(&self.executed);
        let script = Arc::clone(&self.script);

        Box::pin(async move {
            for t in tasks {
                let task_id = t.key.task_id.clone();
                {
                    let mut guard = executed.lock().unwrap();
                    guard.push(format!("{}#{}", task_id, t.attempt));
                }

                let result = script
                    .lock()
                    .unwrap()
                    .get_mut(&task_id)
                    .and_then(|q| q.pop_front())
                    .unwrap_or(Ok(Completion::Done));

                tx.send(RunEvent::InstanceFinished {
                    task_id,
                    attempt: t.attempt,
                    result,
                })
                .await
                .map_err(anyhow::Error::from)?;
            }
            Ok(())
        })
    }
}
