// tests/songplays_pipeline.rs
//
// Start -> StageEvents -> LoadSongplaysFact -> RunQualityChecks -> End,
// executed with the real worker pool against an in-memory warehouse.

mod common;
use crate::common::builders::{fast_retry, noop_task};
use crate::common::{connections, count, date, event_line, init_tracing, warehouse_with, with_timeout};

use std::error::Error;
use std::fs;
use std::sync::Arc;

use batchdag::cli::{CliArgs, Command, RunArgs, SetupArgs, StatusArgs};
use batchdag::connections::ConnectionProvider;
use batchdag::dag::{DagGraph, InstanceKey, InstanceStore, TaskDefinition, TaskState};
use batchdag::engine::outcome::EXIT_QUALITY_FAILURE;
use batchdag::engine::{cancel_channel, FailureClass, Pipeline, RunOutcome};
use batchdag::operators::{
    DataQualityOperator, LoadMode, LoadOperator, OperatorSpec, QualityCheck, StageOperator,
};
use batchdag::storage::MemoryObjectStore;
use batchdag::warehouse::{SqliteWarehouse, Warehouse};

type TestResult = Result<(), Box<dyn Error>>;

const DDL: &str = "
CREATE TABLE staging_events (partition_key TEXT NOT NULL, userid INTEGER, song TEXT, songid TEXT, page TEXT);
CREATE TABLE songplays (start_date TEXT NOT NULL, user_id INTEGER, songid TEXT);
";

fn songplays_dag() -> DagGraph {
    let stage = OperatorSpec::Stage(StageOperator {
        table: "staging_events".into(),
        source: "log_data/{year}/{month}/{day}/".into(),
        source_conn: "object-store".into(),
        warehouse_conn: "warehouse".into(),
        partition_column: "partition_key".into(),
        skip_if_empty: false,
    });
    let load = OperatorSpec::LoadFact(LoadOperator {
        table: "songplays".into(),
        sql: "SELECT partition_key, userid, songid FROM staging_events \
              WHERE page = 'NextSong' AND partition_key = '{ds}'"
            .into(),
        mode: LoadMode::Append,
        warehouse_conn: "warehouse".into(),
        columns: vec!["start_date".into(), "user_id".into(), "songid".into()],
        partition_column: Some("start_date".into()),
    });
    let checks = OperatorSpec::DataQuality(DataQualityOperator {
        checks: vec![QualityCheck::count_equals(
            "songid_not_null",
            "SELECT COUNT(*) FROM songplays WHERE songid IS NULL AND start_date = '{ds}'",
            0,
        )],
        warehouse_conn: "warehouse".into(),
    });

    DagGraph::new(
        "sparkify",
        vec![
            noop_task("Start"),
            TaskDefinition::new("StageEvents", stage)
                .after("Start")
                .with_retry(fast_retry(3)),
            TaskDefinition::new("LoadSongplaysFact", load)
                .after("StageEvents")
                .with_retry(fast_retry(3)),
            TaskDefinition::new("RunQualityChecks", checks)
                .after("LoadSongplaysFact")
                .with_retry(fast_retry(1)),
            noop_task("End").after("RunQualityChecks"),
        ],
    )
    .expect("valid songplays dag")
}

fn pipeline(wh: &Arc<SqliteWarehouse>, store: &Arc<MemoryObjectStore>) -> Pipeline {
    let conns: Arc<dyn ConnectionProvider> = Arc::new(connections(wh, store));
    Pipeline::new(
        songplays_dag(),
        Arc::new(InstanceStore::open_in_memory().unwrap()),
        conns,
        4,
    )
}

#[tokio::test]
async fn clean_partition_runs_every_task_to_success() -> TestResult {
    init_tracing();
    let wh = warehouse_with(DDL);
    let store = Arc::new(MemoryObjectStore::new());
    store.put(
        "log_data/2018/11/05/events.json",
        [
            event_line(8, Some("SOAAA"), "NextSong"),
            event_line(8, None, "Home"),
            event_line(15, Some("SOBBB"), "NextSong"),
        ]
        .join("\n"),
    );
    let pipeline = pipeline(&wh, &store);
    let (_tx, cancel) = cancel_channel();

    let report = with_timeout(pipeline.run_date(date("2018-11-05"), cancel)).await?;

    assert_eq!(report.outcome, RunOutcome::Success);
    for task in ["Start", "StageEvents", "LoadSongplaysFact", "RunQualityChecks", "End"] {
        assert_eq!(report.state_of(task), Some(TaskState::Success), "{task}");
    }
    assert_eq!(count(&wh, "SELECT COUNT(*) FROM staging_events"), 3);
    assert_eq!(count(&wh, "SELECT COUNT(*) FROM songplays"), 2);
    Ok(())
}

#[tokio::test]
async fn null_song_ids_fail_the_quality_gate() -> TestResult {
    init_tracing();
    let wh = warehouse_with(DDL);
    let store = Arc::new(MemoryObjectStore::new());
    store.put(
        "log_data/2018/11/05/events.json",
        [
            event_line(8, None, "NextSong"),
            event_line(15, None, "NextSong"),
            event_line(26, None, "NextSong"),
        ]
        .join("\n"),
    );
    let pipeline = pipeline(&wh, &store);
    let (_tx, cancel) = cancel_channel();

    let report = with_timeout(pipeline.run_date(date("2018-11-05"), cancel)).await?;

    match &report.outcome {
        RunOutcome::Failed { task, reason, class } => {
            assert_eq!(task, "RunQualityChecks");
            assert_eq!(*class, FailureClass::QualityCheckFailure);
            assert!(reason.contains("songid_not_null"), "{reason}");
            assert!(reason.contains("observed 3, expected == 0"), "{reason}");
        }
        other => panic!("expected quality failure, got {other:?}"),
    }
    assert_eq!(report.outcome.exit_code(), EXIT_QUALITY_FAILURE);
    assert_eq!(report.state_of("LoadSongplaysFact"), Some(TaskState::Success));
    assert_eq!(report.state_of("RunQualityChecks"), Some(TaskState::Failed));
    assert_eq!(report.state_of("End"), Some(TaskState::UpstreamFailed));
    assert_eq!(report.instance("RunQualityChecks").unwrap().retry_count, 1);
    Ok(())
}

#[tokio::test]
async fn transient_storage_errors_are_retried() -> TestResult {
    init_tracing();
    let wh = warehouse_with(DDL);
    let store = Arc::new(MemoryObjectStore::new());
    store.put(
        "log_data/2018/11/05/events.json",
        event_line(8, Some("SOAAA"), "NextSong"),
    );
    store.fail_next_reads(2);
    let pipeline = pipeline(&wh, &store);
    let (_tx, cancel) = cancel_channel();

    let report = with_timeout(pipeline.run_date(date("2018-11-05"), cancel)).await?;

    assert!(report.outcome.is_success(), "{}", report.outcome);
    assert_eq!(report.instance("StageEvents").unwrap().retry_count, 2);

    let history = pipeline
        .store()
        .history(&InstanceKey::new("sparkify", "StageEvents", date("2018-11-05")))?;
    let retries = history.iter().filter(|t| t.to == TaskState::UpForRetry).count();
    assert_eq!(retries, 2);
    Ok(())
}

#[tokio::test]
async fn rerunning_a_date_does_not_duplicate_rows() -> TestResult {
    init_tracing();
    let wh = warehouse_with(DDL);
    let store = Arc::new(MemoryObjectStore::new());
    store.put(
        "log_data/2018/11/05/events.json",
        [
            event_line(8, Some("SOAAA"), "NextSong"),
            event_line(15, Some("SOBBB"), "NextSong"),
        ]
        .join("\n"),
    );
    let pipeline = pipeline(&wh, &store);

    for _ in 0..2 {
        let (_tx, cancel) = cancel_channel();
        let report = with_timeout(pipeline.run_date(date("2018-11-05"), cancel)).await?;
        assert!(report.outcome.is_success());
    }

    assert_eq!(count(&wh, "SELECT COUNT(*) FROM staging_events"), 2);
    assert_eq!(count(&wh, "SELECT COUNT(*) FROM songplays"), 2);
    Ok(())
}

const CONFIG: &str = r#"
[dag]
id = "sparkify"
description = "Load Sparkify listening events"

[scheduler]
retry_delay = "10ms"
workers = 2
state_db = "state/state.db"

[connections.warehouse]
kind = "sqlite"
path = "warehouse.db"
pool_size = 2

[connections.object-store]
kind = "local"
root = "data"

[[task]]
id = "Start"
operator = "custom"
callback = "noop"

[[task]]
id = "StageEvents"
operator = "stage"
table = "staging_events"
source = "log_data/{year}/{month}/{day}/"
after = ["Start"]

[[task]]
id = "LoadSongplaysFact"
operator = "load_fact"
table = "songplays"
sql = "SELECT partition_key, userid, songid FROM staging_events WHERE page = 'NextSong' AND partition_key = '{ds}'"
columns = ["start_date", "user_id", "songid"]
partition_column = "start_date"
after = ["StageEvents"]

[[task]]
id = "RunQualityChecks"
operator = "data_quality"
after = ["LoadSongplaysFact"]

[[task.checks]]
name = "songplays_not_empty"
sql = "SELECT COUNT(*) FROM songplays WHERE start_date = '{ds}'"
expected = 0
comparison = "gt"

[[task]]
id = "End"
operator = "custom"
callback = "noop"
after = ["RunQualityChecks"]
"#;

fn cli(config: &std::path::Path, command: Command) -> CliArgs {
    CliArgs {
        config: config.display().to_string(),
        log_level: None,
        events: false,
        command,
    }
}

#[tokio::test]
async fn cli_setup_run_and_status_from_a_config_file() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let config = dir.path().join("Batchdag.toml");
    fs::write(&config, CONFIG)?;
    fs::write(dir.path().join("schema.sql"), DDL)?;
    let partition = dir.path().join("data/log_data/2018/11/05");
    fs::create_dir_all(&partition)?;
    fs::write(
        partition.join("events.json"),
        [
            event_line(8, Some("SOAAA"), "NextSong"),
            event_line(15, Some("SOBBB"), "NextSong"),
            event_line(15, None, "Logout"),
        ]
        .join("\n"),
    )?;

    let code = batchdag::run(cli(
        &config,
        Command::Setup(SetupArgs {
            ddl: "schema.sql".into(),
            connection: "warehouse".into(),
        }),
    ))
    .await?;
    assert_eq!(code, 0);

    assert_eq!(batchdag::run(cli(&config, Command::Validate)).await?, 0);

    let code = with_timeout(batchdag::run(cli(
        &config,
        Command::Run(RunArgs {
            date: Some(date("2018-11-05")),
            catchup: false,
        }),
    )))
    .await?;
    assert_eq!(code, 0);

    let wh = SqliteWarehouse::open(dir.path().join("warehouse.db"), 1)?;
    assert_eq!(count(&wh, "SELECT COUNT(*) FROM songplays"), 2);
    assert_eq!(
        wh.table_columns("songplays")?,
        ["start_date", "user_id", "songid"]
    );

    let store = InstanceStore::open(dir.path().join("state/state.db"))?;
    let inst = store
        .get(&InstanceKey::new("sparkify", "End", date("2018-11-05")))?
        .expect("End instance recorded");
    assert_eq!(inst.state, TaskState::Success);

    let code = batchdag::run(cli(
        &config,
        Command::Status(StatusArgs {
            task: "End".into(),
            date: date("2018-11-05"),
            history: true,
        }),
    ))
    .await?;
    assert_eq!(code, 0);

    let err = batchdag::run(cli(
        &config,
        Command::Status(StatusArgs {
            task: "Nope".into(),
            date: date("2018-11-05"),
            history: false,
        }),
    ))
    .await
    .unwrap_err();
    assert!(matches!(err, batchdag::errors::BatchdagError::TaskNotFound(_)));
    Ok(())
}

#[tokio::test]
async fn cli_run_reports_quality_failure_exit_code() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let config = dir.path().join("Batchdag.toml");
    fs::write(&config, CONFIG)?;
    fs::write(dir.path().join("schema.sql"), DDL)?;
    fs::create_dir_all(dir.path().join("data"))?;

    batchdag::run(cli(
        &config,
        Command::Setup(SetupArgs {
            ddl: "schema.sql".into(),
            connection: "warehouse".into(),
        }),
    ))
    .await?;

    // No events at all: the stage loads nothing and the gate rejects it.
    let code = with_timeout(batchdag::run(cli(
        &config,
        Command::Run(RunArgs {
            date: Some(date("2018-11-07")),
            catchup: false,
        }),
    )))
    .await?;
    assert_eq!(code, EXIT_QUALITY_FAILURE);
    Ok(())
}
