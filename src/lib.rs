// src/lib.rs

pub mod alerts;
pub mod cli;
pub mod config;
pub mod connections;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod operators;
pub mod storage;
pub mod warehouse;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::alerts::{AlertFanout, AlertSink, JsonLinesAlertSink, TracingAlertSink};
use crate::cli::{BackfillArgs, CliArgs, Command, RunArgs, SetupArgs, StatusArgs};
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::connections::{ConnectionProvider, ConnectionRegistry};
use crate::dag::{InstanceKey, InstanceStore};
use crate::engine::backfill::date_range;
use crate::engine::outcome::{EXIT_INTERNAL, EXIT_STRUCTURAL, EXIT_SUCCESS};
use crate::engine::{
    cancel_channel, BackfillMode, BackfillOptions, BackfillReport, BackfillRunner, Pipeline,
    RunReport,
};
use crate::errors::{BatchdagError, Result};
use crate::operators::OperatorRegistry;

/// High-level entry point used by `main.rs`.
///
/// Returns the process exit code for commands that ran to completion; an
/// `Err` is mapped by [`exit_code_for`].
pub async fn run(args: CliArgs) -> Result<i32> {
    run_with_registry(args, &OperatorRegistry::default()).await
}

/// Like [`run`], with extra custom operators available to `operator =
/// "custom"` tasks.
pub async fn run_with_registry(args: CliArgs, registry: &OperatorRegistry) -> Result<i32> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)?;

    match &args.command {
        Command::Validate => validate(&cfg, registry),
        Command::Run(run_args) => {
            let pipeline = build_pipeline(&cfg, registry, args.events)?;
            trigger(&cfg, &pipeline, run_args).await
        }
        Command::Backfill(backfill_args) => {
            let pipeline = build_pipeline(&cfg, registry, args.events)?;
            backfill(&pipeline, backfill_args).await
        }
        Command::Status(status_args) => status(&cfg, status_args),
        Command::Setup(setup_args) => setup(&cfg, setup_args),
    }
}

/// Exit code for an error that aborted a command.
pub fn exit_code_for(err: &BatchdagError) -> i32 {
    match err {
        BatchdagError::ConfigError(_)
        | BatchdagError::Structural(_)
        | BatchdagError::TomlError(_) => EXIT_STRUCTURAL,
        _ => EXIT_INTERNAL,
    }
}

fn build_pipeline(cfg: &ConfigFile, registry: &OperatorRegistry, events: bool) -> Result<Pipeline> {
    let mut alerts = AlertFanout::new().with(Arc::new(TracingAlertSink));
    if events {
        alerts = alerts.with(Arc::new(JsonLinesAlertSink));
    }
    let sink: Arc<dyn AlertSink> = Arc::new(alerts);
    Ok(Pipeline::from_config(cfg, registry)?.with_alerts(sink))
}

/// Ctrl-C → cancel the Run(s): in-flight instances finish, nothing new starts.
fn spawn_ctrl_c_handler() -> watch::Receiver<bool> {
    let (tx, rx) = cancel_channel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            return;
        }
        info!("Ctrl+C received; cancelling");
        let _ = tx.send(true);
    });
    rx
}

fn validate(cfg: &ConfigFile, registry: &OperatorRegistry) -> Result<i32> {
    let graph = cfg.build_graph(registry)?;

    println!("dag '{}' is valid ({} tasks)", graph.dag_id(), graph.len());
    if let Some(desc) = &cfg.dag.description {
        println!("  {desc}");
    }
    println!();
    println!("topological order:");
    for (i, task) in graph.topological_order().enumerate() {
        let upstream = graph.upstream_of(&task.id);
        if upstream.is_empty() {
            println!("  {:>2}. {} [{}]", i + 1, task.id, task.operator.kind_name());
        } else {
            println!(
                "  {:>2}. {} [{}] after {}",
                i + 1,
                task.id,
                task.operator.kind_name(),
                upstream.join(", ")
            );
        }
    }

    debug!("validate complete (no execution)");
    Ok(EXIT_SUCCESS)
}

async fn trigger(cfg: &ConfigFile, pipeline: &Pipeline, args: &RunArgs) -> Result<i32> {
    let cancel = spawn_ctrl_c_handler();
    let today = Utc::now().date_naive();

    if args.catchup {
        let start = cfg.dag.start_date.ok_or_else(|| {
            BatchdagError::ConfigError("`run --catchup` needs [dag].start_date".to_string())
        })?;
        let dates = catchup_dates(pipeline, start, today)?;
        if dates.is_empty() {
            println!("nothing to catch up: every date since {start} already succeeded");
            return Ok(EXIT_SUCCESS);
        }
        let runner = BackfillRunner::new(pipeline.clone(), BackfillOptions::default());
        let report = runner.run_dates(dates, cancel).await?;
        print_backfill(&report);
        return Ok(report.exit_code());
    }

    let date = args.date.unwrap_or(today);
    let report = pipeline.run_date(date, cancel).await?;
    print_run(&report);
    Ok(report.outcome.exit_code())
}

/// Dates from `start` to `end` without a successful Run yet.
fn catchup_dates(pipeline: &Pipeline, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
    if start > end {
        return Ok(Vec::new());
    }
    let graph = pipeline.graph();
    let done = pipeline
        .store()
        .successful_dates(graph.dag_id(), graph.len())?;
    Ok(date_range(start, end)?
        .into_iter()
        .filter(|d| !done.contains(d))
        .collect())
}

async fn backfill(pipeline: &Pipeline, args: &BackfillArgs) -> Result<i32> {
    let options = BackfillOptions {
        mode: match args.parallel {
            Some(n) if n > 1 => BackfillMode::Parallel { max_runs: n },
            _ => BackfillMode::Sequential,
        },
        stop_on_first_failure: args.stop_on_failure,
    };
    let runner = BackfillRunner::new(pipeline.clone(), options);
    let report = runner.run(args.start, args.end, spawn_ctrl_c_handler()).await?;
    print_backfill(&report);
    Ok(report.exit_code())
}

fn status(cfg: &ConfigFile, args: &StatusArgs) -> Result<i32> {
    if !cfg.task.iter().any(|t| t.id == args.task) {
        return Err(BatchdagError::TaskNotFound(args.task.clone()));
    }
    let store = match cfg.state_db_path() {
        Some(path) => InstanceStore::open(path)?,
        None => InstanceStore::open_in_memory()?,
    };
    let key = InstanceKey::new(cfg.dag.id.clone(), args.task.clone(), args.date);

    let Some(inst) = store.get(&key)? else {
        println!("{key}: no task instance (date never scheduled)");
        return Ok(EXIT_SUCCESS);
    };

    println!("{key}");
    println!("  state:       {}", inst.state);
    println!("  retry_count: {}", inst.retry_count);
    let ts = |t: Option<chrono::DateTime<Utc>>| t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into());
    println!("  queued_at:   {}", ts(inst.queued_at));
    println!("  started_at:  {}", ts(inst.started_at));
    println!("  ended_at:    {}", ts(inst.ended_at));
    if let Some(at) = inst.next_eligible_at {
        println!("  next_retry:  {}", at.to_rfc3339());
    }
    if let Some(failure) = &inst.failure {
        println!("  failure:     [{}] {}", failure.kind, failure.reason);
    }

    if args.history {
        println!();
        println!("history:");
        for t in store.history(&key)? {
            println!(
                "  {}  {} -> {}  (retry_count={}){}",
                t.at.to_rfc3339(),
                t.from,
                t.to,
                t.retry_count,
                t.reason.map(|r| format!("  {r}")).unwrap_or_default()
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

fn setup(cfg: &ConfigFile, args: &SetupArgs) -> Result<i32> {
    let ddl_path = config::model::resolve(&cfg.base_dir, &args.ddl);
    let ddl = std::fs::read_to_string(&ddl_path)?;
    let connections = ConnectionRegistry::from_config(&cfg.connections, &cfg.base_dir)?;
    let warehouse = connections
        .warehouse(&args.connection)
        .map_err(|e| BatchdagError::ConfigError(e.to_string()))?;
    warehouse
        .execute_script(&ddl)
        .map_err(|e| BatchdagError::Other(e.into()))?;
    info!(connection = %args.connection, ddl = %ddl_path.display(), "schema applied");
    println!("applied {} to '{}'", ddl_path.display(), args.connection);
    Ok(EXIT_SUCCESS)
}

fn print_run(report: &RunReport) {
    println!("{} {} -> {}", report.dag_id, report.logical_date, report.outcome);
    for inst in &report.instances {
        println!(
            "  {:<28} {:<16} retries={}",
            inst.key.task_id,
            inst.state.to_string(),
            inst.retry_count
        );
    }
}

fn print_backfill(report: &BackfillReport) {
    for run in &report.runs {
        println!("{}  {}", run.logical_date, run.outcome);
    }
    for date in &report.not_run {
        println!("{date}  NOT RUN");
    }
}
