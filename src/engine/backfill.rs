// src/engine/backfill.rs

//! Backfill Runner: one Run per logical date over an inclusive date range.
//!
//! Runs for different dates are data-independent, so parallel mode simply
//! runs several dates at once over the shared worker pool. Each date's
//! outcome is exactly what triggering that date alone would produce.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Days, NaiveDate};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::engine::outcome::{RunOutcome, RunReport, EXIT_CANCELLED, EXIT_SUCCESS};
use crate::engine::pipeline::Pipeline;
use crate::errors::{BatchdagError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackfillMode {
    /// Strictly chronological, one date at a time.
    #[default]
    Sequential,
    /// Up to `max_runs` dates at once.
    Parallel { max_runs: usize },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BackfillOptions {
    pub mode: BackfillMode,
    /// Do not start new dates once one date has failed.
    pub stop_on_first_failure: bool,
}

/// Per-date outcomes of a backfill, in chronological order.
#[derive(Debug, Clone, Default)]
pub struct BackfillReport {
    pub runs: Vec<RunReport>,
    /// Dates never started (stop-on-first-failure or cancellation).
    pub not_run: Vec<NaiveDate>,
}

impl BackfillReport {
    pub fn outcome_for(&self, date: NaiveDate) -> Option<&RunOutcome> {
        self.runs
            .iter()
            .find(|r| r.logical_date == date)
            .map(|r| &r.outcome)
    }

    pub fn all_succeeded(&self) -> bool {
        self.not_run.is_empty() && self.runs.iter().all(|r| r.outcome.is_success())
    }

    /// Earliest date whose Run did not succeed.
    pub fn first_failure(&self) -> Option<&RunReport> {
        self.runs.iter().find(|r| !r.outcome.is_success())
    }

    pub fn exit_code(&self) -> i32 {
        match self.first_failure() {
            Some(run) => run.outcome.exit_code(),
            None if self.not_run.is_empty() => EXIT_SUCCESS,
            None => EXIT_CANCELLED,
        }
    }
}

/// Inclusive list of dates from `start` to `end`.
pub fn date_range(start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
    if start > end {
        return Err(BatchdagError::ConfigError(format!(
            "backfill start {start} is after end {end}"
        )));
    }
    let mut dates = Vec::new();
    let mut d = start;
    while d <= end {
        dates.push(d);
        d = match d.checked_add_days(Days::new(1)) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(dates)
}

#[derive(Debug, Clone)]
pub struct BackfillRunner {
    pipeline: Pipeline,
    options: BackfillOptions,
}

impl BackfillRunner {
    pub fn new(pipeline: Pipeline, options: BackfillOptions) -> Self {
        Self { pipeline, options }
    }

    pub async fn run(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        cancel: watch::Receiver<bool>,
    ) -> Result<BackfillReport> {
        let dates = date_range(start, end)?;
        self.run_dates(dates, cancel).await
    }

    /// Run an explicit list of dates (used by catchup).
    pub async fn run_dates(
        &self,
        mut dates: Vec<NaiveDate>,
        cancel: watch::Receiver<bool>,
    ) -> Result<BackfillReport> {
        dates.sort();
        dates.dedup();
        info!(
            dag = self.pipeline.graph().dag_id(),
            dates = dates.len(),
            mode = ?self.options.mode,
            stop_on_first_failure = self.options.stop_on_first_failure,
            "backfill started"
        );

        let mut report = match self.options.mode {
            BackfillMode::Sequential => self.run_sequential(dates, cancel).await?,
            BackfillMode::Parallel { max_runs } => {
                self.run_parallel(dates, max_runs.max(1), cancel).await?
            }
        };

        report.runs.sort_by_key(|r| r.logical_date);
        report.not_run.sort();
        info!(
            runs = report.runs.len(),
            failed = report.runs.iter().filter(|r| !r.outcome.is_success()).count(),
            not_run = report.not_run.len(),
            "backfill finished"
        );
        Ok(report)
    }

    async fn run_sequential(
        &self,
        dates: Vec<NaiveDate>,
        cancel: watch::Receiver<bool>,
    ) -> Result<BackfillReport> {
        let mut report = BackfillReport::default();
        let mut stopped = false;

        for date in dates {
            if stopped || *cancel.borrow() {
                report.not_run.push(date);
                continue;
            }
            let run = self.pipeline.run_date(date, cancel.clone()).await?;
            if !run.outcome.is_success() {
                warn!(logical_date = %date, outcome = %run.outcome, "backfill date did not succeed");
                stopped = self.options.stop_on_first_failure;
            }
            report.runs.push(run);
        }

        Ok(report)
    }

    async fn run_parallel(
        &self,
        dates: Vec<NaiveDate>,
        max_runs: usize,
        cancel: watch::Receiver<bool>,
    ) -> Result<BackfillReport> {
        let permits = Arc::new(Semaphore::new(max_runs));
        let stopped = Arc::new(AtomicBool::new(false));
        let stop_on_failure = self.options.stop_on_first_failure;
        let mut set = JoinSet::new();

        for date in dates {
            let pipeline = self.pipeline.clone();
            let permits = Arc::clone(&permits);
            let stopped = Arc::clone(&stopped);
            let cancel = cancel.clone();

            set.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| BatchdagError::Other(e.into()))?;
                if stopped.load(Ordering::SeqCst) || *cancel.borrow() {
                    return Ok((date, None));
                }
                let run = pipeline.run_date(date, cancel).await?;
                if !run.outcome.is_success() {
                    warn!(logical_date = %date, outcome = %run.outcome, "backfill date did not succeed");
                    if stop_on_failure {
                        stopped.store(true, Ordering::SeqCst);
                    }
                }
                Ok::<_, BatchdagError>((date, Some(run)))
            });
        }

        let mut report = BackfillReport::default();
        while let Some(joined) = set.join_next().await {
            let (date, run) = joined.map_err(|e| BatchdagError::Other(e.into()))??;
            match run {
                Some(run) => report.runs.push(run),
                None => report.not_run.push(date),
            }
        }
        Ok(report)
    }
}
