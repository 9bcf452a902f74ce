// src/alerts.rs

//! Alerting hook.
//!
//! The engine emits an [`AlertEvent`] whenever a Task Instance reaches a
//! terminal state and once per finished Run. Delivery is up to whatever
//! [`AlertSink`] is plugged in; the crate ships a tracing sink (default), a
//! channel sink for embedding and tests, and a JSON-lines sink for `--events`.

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::dag::instance::TaskState;
use crate::dag::task::TaskId;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AlertEvent {
    /// A Task Instance reached SUCCESS, FAILED, UPSTREAM_FAILED or SKIPPED.
    InstanceFinished {
        dag_id: String,
        task_id: TaskId,
        logical_date: NaiveDate,
        state: TaskState,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    /// A Run finished (or was cancelled).
    RunFinished {
        dag_id: String,
        logical_date: NaiveDate,
        outcome: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        failed_task: Option<TaskId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        at: DateTime<Utc>,
    },
}

impl AlertEvent {
    pub fn logical_date(&self) -> NaiveDate {
        match self {
            AlertEvent::InstanceFinished { logical_date, .. }
            | AlertEvent::RunFinished { logical_date, .. } => *logical_date,
        }
    }
}

/// Subscriber for [`AlertEvent`]s. Must not block.
pub trait AlertSink: Send + Sync {
    fn emit(&self, event: &AlertEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn emit(&self, event: &AlertEvent) {
        match event {
            AlertEvent::InstanceFinished {
                task_id,
                logical_date,
                state,
                reason,
                ..
            } => {
                if state.is_failure() {
                    warn!(
                        task = %task_id,
                        %logical_date,
                        %state,
                        reason = reason.as_deref().unwrap_or(""),
                        "alert: task instance finished"
                    );
                } else {
                    info!(task = %task_id, %logical_date, %state, "alert: task instance finished");
                }
            }
            AlertEvent::RunFinished {
                dag_id,
                logical_date,
                outcome,
                failed_task,
                reason,
                ..
            } => {
                if outcome == "success" {
                    info!(dag = %dag_id, %logical_date, %outcome, "alert: run finished");
                } else {
                    warn!(
                        dag = %dag_id,
                        %logical_date,
                        %outcome,
                        failed_task = failed_task.as_deref().unwrap_or(""),
                        reason = reason.as_deref().unwrap_or(""),
                        "alert: run finished"
                    );
                }
            }
        }
    }
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelAlertSink {
    tx: mpsc::UnboundedSender<AlertEvent>,
}

impl ChannelAlertSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AlertEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelAlertSink {
    fn emit(&self, event: &AlertEvent) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.tx.send(event.clone());
    }
}

/// Writes one JSON object per line to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLinesAlertSink;

impl AlertSink for JsonLinesAlertSink {
    fn emit(&self, event: &AlertEvent) {
        match serde_json::to_string(event) {
            Ok(line) => {
                let mut out = std::io::stdout().lock();
                if let Err(err) = writeln!(out, "{line}") {
                    warn!(error = %err, "failed to write alert event to stdout");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialise alert event"),
        }
    }
}

/// Fans each event out to several sinks.
#[derive(Clone, Default)]
pub struct AlertFanout {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl fmt::Debug for AlertFanout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertFanout")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl AlertFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AlertSink for AlertFanout {
    fn emit(&self, event: &AlertEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
