// src/engine/runtime.rs

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::alerts::AlertSink;
use crate::dag::ScheduledInstance;
use crate::engine::outcome::RunOutcome;
use crate::errors::{BatchdagError, Result};
use crate::exec::ExecutorBackend;

use super::core::{CoreCommand, CoreRuntime};
use super::RunEvent;

/// Upper bound on a single idle wait; the loop simply re-ticks afterwards.
const MAX_IDLE_WAIT: Duration = Duration::from_secs(60);

/// Drives one Run in response to [`RunEvent`]s, and delegates operator
/// execution to an [`ExecutorBackend`].
///
/// This is a pure IO shell around [`CoreRuntime`], which contains all the
/// run semantics. This struct handles async IO: reading completion events,
/// sleeping until the next retry is due, watching for cancellation and
/// dispatching instances to the executor.
pub struct Runtime<E: ExecutorBackend> {
    core: CoreRuntime,
    event_rx: mpsc::Receiver<RunEvent>,
    executor: E,
    alerts: Arc<dyn AlertSink>,
    cancel: watch::Receiver<bool>,
}

impl<E: ExecutorBackend> fmt::Debug for Runtime<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl<E: ExecutorBackend> Runtime<E> {
    pub fn new(
        core: CoreRuntime,
        event_rx: mpsc::Receiver<RunEvent>,
        executor: E,
        alerts: Arc<dyn AlertSink>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            core,
            event_rx,
            executor,
            alerts,
            cancel,
        }
    }

    /// Main event loop.
    ///
    /// - Starts the Run.
    /// - Feeds completions, timer ticks and cancellation into the core.
    /// - Executes the commands returned by the core.
    pub async fn run(mut self) -> Result<RunOutcome> {
        let date = self.core.logical_date();
        info!(logical_date = %date, "run started");

        let mut outcome = None;
        let mut cancel_open = true;

        let mut event = RunEvent::Start;
        loop {
            debug!(logical_date = %date, ?event, "runtime received event");

            let step = self.core.step(event, Utc::now())?;
            for command in step.commands {
                if let CoreCommand::Finish(o) = command {
                    outcome = Some(o);
                } else {
                    self.execute_command(command).await?;
                }
            }

            if !step.keep_running {
                break;
            }

            if cancel_open && *self.cancel.borrow() && !self.core.is_cancelled() {
                event = RunEvent::CancelRequested;
                continue;
            }

            let wait = wait_for(step.wake_at);
            event = loop {
                tokio::select! {
                    maybe = self.event_rx.recv() => {
                        match maybe {
                            Some(e) => break e,
                            None => {
                                return Err(BatchdagError::Other(anyhow::anyhow!(
                                    "run event channel closed before the run finished"
                                )));
                            }
                        }
                    }
                    _ = tokio::time::sleep(wait) => break RunEvent::Tick,
                    changed = self.cancel.changed(), if cancel_open => {
                        match changed {
                            Ok(()) if *self.cancel.borrow() => break RunEvent::CancelRequested,
                            Ok(()) => {}
                            // Sender gone: nobody can cancel this run anymore.
                            Err(_) => cancel_open = false,
                        }
                    }
                }
            };
        }

        let outcome = outcome.ok_or_else(|| {
            BatchdagError::Other(anyhow::anyhow!("run loop stopped without an outcome"))
        })?;
        info!(logical_date = %date, %outcome, "runtime exiting");
        Ok(outcome)
    }

    /// Execute a single command from the core.
    async fn execute_command(&mut self, command: CoreCommand) -> Result<()> {
        match command {
            CoreCommand::Dispatch(instances) => self.dispatch(instances).await?,
            CoreCommand::Notify(event) => self.alerts.emit(&event),
            CoreCommand::Finish(_) => {}
        }
        Ok(())
    }

    async fn dispatch(&mut self, instances: Vec<ScheduledInstance>) -> Result<()> {
        if instances.is_empty() {
            return Ok(());
        }

        let names: Vec<_> = instances.iter().map(|i| i.key.task_id.as_str()).collect();
        debug!(?names, "dispatching instances");

        self.executor.spawn_ready_tasks(instances).await
    }
}

fn wait_for(wake_at: Option<DateTime<Utc>>) -> Duration {
    match wake_at {
        Some(at) => (at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(MAX_IDLE_WAIT),
        None => MAX_IDLE_WAIT,
    }
}
