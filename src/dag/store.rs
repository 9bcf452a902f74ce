// src/dag/store.rs

//! Task Instance state store.
//!
//! The single source of truth for instance state. Every state change goes
//! through [`InstanceStore::transition`], a compare-and-set: the row is only
//! updated if it is still in the expected `from` state, so two workers can
//! never both move the same instance from `QUEUED` to `RUNNING`. Each applied
//! transition appends a row to the history table; instance rows are never
//! deleted.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, trace};

use crate::dag::instance::{FailureRecord, InstanceKey, TaskInstance, TaskState, Transition};
use crate::errors::{BatchdagError, FailureKind, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS task_instances (
    dag_id           TEXT    NOT NULL,
    task_id          TEXT    NOT NULL,
    logical_date     TEXT    NOT NULL,
    state            TEXT    NOT NULL,
    retry_count      INTEGER NOT NULL DEFAULT 0,
    queued_at        TEXT,
    started_at       TEXT,
    ended_at         TEXT,
    next_eligible_at TEXT,
    failure_kind     TEXT,
    failure_reason   TEXT,
    PRIMARY KEY (dag_id, task_id, logical_date)
);

CREATE TABLE IF NOT EXISTS task_instance_history (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    dag_id       TEXT    NOT NULL,
    task_id      TEXT    NOT NULL,
    logical_date TEXT    NOT NULL,
    from_state   TEXT    NOT NULL,
    to_state     TEXT    NOT NULL,
    at           TEXT    NOT NULL,
    retry_count  INTEGER NOT NULL,
    reason       TEXT
);

CREATE INDEX IF NOT EXISTS idx_history_instance
    ON task_instance_history (dag_id, task_id, logical_date);
"#;

const SELECT_INSTANCE: &str = "SELECT dag_id, task_id, logical_date, state, retry_count, \
     queued_at, started_at, ended_at, next_eligible_at, failure_kind, failure_reason \
     FROM task_instances";

impl ToSql for TaskState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(ValueRef::Text(self.as_str().as_bytes())))
    }
}

impl FromSql for TaskState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|_| FromSqlError::InvalidType)
    }
}

/// Extra data applied together with a state change.
#[derive(Debug, Clone)]
pub struct TransitionChange {
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
    pub failure: Option<FailureRecord>,
    pub next_eligible_at: Option<DateTime<Utc>>,
}

impl TransitionChange {
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            at,
            reason: None,
            failure: None,
            next_eligible_at: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_failure(mut self, failure: FailureRecord) -> Self {
        self.reason = Some(failure.reason.clone());
        self.failure = Some(failure);
        self
    }

    pub fn eligible_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_eligible_at = Some(at);
        self
    }
}

pub struct InstanceStore {
    conn: Mutex<Connection>,
    location: String,
}

impl std::fmt::Debug for InstanceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceStore")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl InstanceStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn, path.display().to_string())
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, ":memory:".to_string())
    }

    fn init(conn: Connection, location: String) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        debug!(location = %location, "instance store ready");
        Ok(Self {
            conn: Mutex::new(conn),
            location,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the instance in state `NONE` if it does not exist yet, and
    /// return its current row.
    pub fn ensure(&self, key: &InstanceKey) -> Result<TaskInstance> {
        let conn = self.conn();
        let created = conn.execute(
            "INSERT OR IGNORE INTO task_instances (dag_id, task_id, logical_date, state, retry_count) \
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![key.dag_id, key.task_id, key.logical_date, TaskState::None],
        )?;
        if created > 0 {
            trace!(instance = %key, "created task instance");
        }
        fetch(&conn, key)?.ok_or_else(|| BatchdagError::TaskNotFound(key.to_string()))
    }

    pub fn get(&self, key: &InstanceKey) -> Result<Option<TaskInstance>> {
        fetch(&self.conn(), key)
    }

    /// All instances of one Run, in no particular order.
    pub fn instances_for_date(&self, dag_id: &str, date: NaiveDate) -> Result<Vec<TaskInstance>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("{SELECT_INSTANCE} WHERE dag_id = ?1 AND logical_date = ?2"))?;
        let rows = stmt
            .query_map(params![dag_id, date], row_to_instance)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Transition history of one instance, oldest first.
    pub fn history(&self, key: &InstanceKey) -> Result<Vec<Transition>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT from_state, to_state, at, retry_count, reason FROM task_instance_history \
             WHERE dag_id = ?1 AND task_id = ?2 AND logical_date = ?3 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![key.dag_id, key.task_id, key.logical_date], |row| {
                Ok(Transition {
                    from: row.get(0)?,
                    to: row.get(1)?,
                    at: row.get(2)?,
                    retry_count: row.get(3)?,
                    reason: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Compare-and-set `from -> to`.
    ///
    /// Returns `Ok(false)` if the instance is no longer in `from` (someone
    /// else moved it first). Edges outside the state machine are rejected.
    pub fn transition(
        &self,
        key: &InstanceKey,
        from: TaskState,
        to: TaskState,
        change: TransitionChange,
    ) -> Result<bool> {
        self.transition_chain(key, from, &[(to, change)])
    }

    /// Compare-and-set `from` through every state in `hops`, in one
    /// transaction.
    ///
    /// Either all hops are applied (one history row each) or none are, so no
    /// reader ever observes the intermediate states.
    pub fn transition_chain(
        &self,
        key: &InstanceKey,
        from: TaskState,
        hops: &[(TaskState, TransitionChange)],
    ) -> Result<bool> {
        let mut prev = from;
        for (to, _) in hops {
            if !prev.can_transition_to(*to) {
                return Err(BatchdagError::InvalidTransition {
                    instance: key.to_string(),
                    from: prev,
                    to: *to,
                });
            }
            prev = *to;
        }

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut inst = fetch(&tx, key)?.ok_or_else(|| BatchdagError::TaskNotFound(key.to_string()))?;
        if inst.state != from {
            trace!(instance = %key, expected = %from, actual = %inst.state, "compare-and-set lost");
            return Ok(false);
        }

        for (to, change) in hops {
            let hop_from = inst.state;
            apply(&mut inst, *to, change);
            append_history(&tx, key, hop_from, *to, change.at, inst.retry_count, change.reason.as_deref())?;
        }
        write_instance(&tx, &inst, from)?;
        tx.commit()?;

        debug!(instance = %key, %from, to = %inst.state, retry_count = inst.retry_count, "task instance transition");
        Ok(true)
    }

    /// Reset an instance to `NONE` so its date can be run again.
    ///
    /// The retry counter and timestamps start over; the history keeps every
    /// earlier transition.
    pub fn clear(&self, key: &InstanceKey, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inst = fetch(&tx, key)?.ok_or_else(|| BatchdagError::TaskNotFound(key.to_string()))?;
        if inst.state == TaskState::None && inst.retry_count == 0 {
            return Ok(());
        }

        let fresh = TaskInstance::new(key.clone());
        write_instance(&tx, &fresh, inst.state)?;
        append_history(&tx, key, inst.state, TaskState::None, at, 0, Some("cleared for new run"))?;
        tx.commit()?;
        Ok(())
    }

    /// Dates whose `expected_tasks` instances all ended SUCCESS or SKIPPED.
    pub fn successful_dates(&self, dag_id: &str, expected_tasks: usize) -> Result<Vec<NaiveDate>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT logical_date FROM task_instances WHERE dag_id = ?1 \
             GROUP BY logical_date \
             HAVING COUNT(*) = ?2 AND SUM(CASE WHEN state IN ('success', 'skipped') THEN 0 ELSE 1 END) = 0 \
             ORDER BY logical_date",
        )?;
        let dates = stmt
            .query_map(params![dag_id, expected_tasks as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<NaiveDate>>>()?;
        Ok(dates)
    }
}

fn apply(inst: &mut TaskInstance, to: TaskState, change: &TransitionChange) {
    let at = change.at;
    inst.state = to;
    match to {
        TaskState::Queued => {
            inst.queued_at = Some(at);
            inst.next_eligible_at = None;
        }
        TaskState::Running => {
            inst.started_at = Some(at);
            inst.ended_at = None;
        }
        TaskState::Success | TaskState::Skipped => {
            inst.ended_at = Some(at);
            inst.failure = None;
        }
        TaskState::Failed | TaskState::UpstreamFailed => {
            inst.ended_at = Some(at);
            inst.failure = change.failure.clone();
        }
        TaskState::UpForRetry => {
            inst.retry_count += 1;
            inst.next_eligible_at = change.next_eligible_at;
        }
        TaskState::None => {}
    }
}

fn fetch(conn: &Connection, key: &InstanceKey) -> Result<Option<TaskInstance>> {
    let inst = conn
        .query_row(
            &format!("{SELECT_INSTANCE} WHERE dag_id = ?1 AND task_id = ?2 AND logical_date = ?3"),
            params![key.dag_id, key.task_id, key.logical_date],
            row_to_instance,
        )
        .optional()?;
    Ok(inst)
}

fn row_to_instance(row: &Row<'_>) -> rusqlite::Result<TaskInstance> {
    let failure_kind: Option<String> = row.get(9)?;
    let failure_reason: Option<String> = row.get(10)?;
    let failure = match (failure_kind.as_deref().and_then(FailureKind::parse), failure_reason) {
        (Some(kind), Some(reason)) => Some(FailureRecord { kind, reason }),
        _ => None,
    };

    Ok(TaskInstance {
        key: InstanceKey {
            dag_id: row.get(0)?,
            task_id: row.get(1)?,
            logical_date: row.get(2)?,
        },
        state: row.get(3)?,
        retry_count: row.get(4)?,
        queued_at: row.get(5)?,
        started_at: row.get(6)?,
        ended_at: row.get(7)?,
        next_eligible_at: row.get(8)?,
        failure,
    })
}

fn write_instance(conn: &Connection, inst: &TaskInstance, expected: TaskState) -> Result<()> {
    let key = &inst.key;
    let updated = conn.execute(
        "UPDATE task_instances SET state = ?1, retry_count = ?2, queued_at = ?3, started_at = ?4, \
         ended_at = ?5, next_eligible_at = ?6, failure_kind = ?7, failure_reason = ?8 \
         WHERE dag_id = ?9 AND task_id = ?10 AND logical_date = ?11 AND state = ?12",
        params![
            inst.state,
            inst.retry_count,
            inst.queued_at,
            inst.started_at,
            inst.ended_at,
            inst.next_eligible_at,
            inst.failure.as_ref().map(|f| f.kind.as_str()),
            inst.failure.as_ref().map(|f| f.reason.as_str()),
            key.dag_id,
            key.task_id,
            key.logical_date,
            expected,
        ],
    )?;
    if updated != 1 {
        return Err(BatchdagError::Other(anyhow::anyhow!(
            "instance {key} changed state concurrently"
        )));
    }
    Ok(())
}

fn append_history(
    conn: &Connection,
    key: &InstanceKey,
    from: TaskState,
    to: TaskState,
    at: DateTime<Utc>,
    retry_count: u32,
    reason: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO task_instance_history \
         (dag_id, task_id, logical_date, from_state, to_state, at, retry_count, reason) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![key.dag_id, key.task_id, key.logical_date, from, to, at, retry_count, reason],
    )?;
    Ok(())
}
