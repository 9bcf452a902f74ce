// src/engine/pipeline.rs

//! Wiring for Runs: DAG, instance store, scheduler, worker pool and alerts.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::alerts::{AlertSink, TracingAlertSink};
use crate::config::ConfigFile;
use crate::connections::{ConnectionProvider, ConnectionRegistry};
use crate::dag::{DagGraph, InstanceStore, Scheduler};
use crate::engine::core::CoreRuntime;
use crate::engine::outcome::RunReport;
use crate::engine::runtime::Runtime;
use crate::engine::RunEvent;
use crate::errors::Result;
use crate::exec::{ExecutorBackend, OperatorExecutor, WorkerPool};
use crate::operators::OperatorRegistry;

/// Everything needed to execute Runs of one DAG.
#[derive(Clone)]
pub struct Pipeline {
    scheduler: Arc<Scheduler>,
    pool: WorkerPool,
    alerts: Arc<dyn AlertSink>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("dag_id", &self.scheduler.graph().dag_id())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// `workers` sizes the shared worker pool and caps concurrently running
    /// instances per Run.
    pub fn new(
        graph: DagGraph,
        store: Arc<InstanceStore>,
        connections: Arc<dyn ConnectionProvider>,
        workers: usize,
    ) -> Self {
        let scheduler = Scheduler::new(Arc::new(graph), store, workers);
        Self {
            scheduler: Arc::new(scheduler),
            pool: WorkerPool::new(connections, workers),
            alerts: Arc::new(TracingAlertSink),
        }
    }

    /// Build from a validated config: open connections and the state store,
    /// then construct the DAG Graph.
    pub fn from_config(cfg: &ConfigFile, registry: &OperatorRegistry) -> Result<Self> {
        let graph = cfg.build_graph(registry)?;
        let connections = ConnectionRegistry::from_config(&cfg.connections, &cfg.base_dir)?;
        let store = match cfg.state_db_path() {
            Some(path) => InstanceStore::open(path)?,
            None => InstanceStore::open_in_memory()?,
        };
        info!(
            dag = graph.dag_id(),
            tasks = graph.len(),
            workers = cfg.scheduler.workers,
            ?connections,
            "pipeline ready"
        );
        Ok(Self::new(
            graph,
            Arc::new(store),
            Arc::new(connections),
            cfg.scheduler.workers,
        ))
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn graph(&self) -> &Arc<DagGraph> {
        self.scheduler.graph()
    }

    pub fn store(&self) -> &Arc<InstanceStore> {
        self.scheduler.store()
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Run every task for `date` to a terminal state with the real operators.
    pub async fn run_date(&self, date: NaiveDate, cancel: watch::Receiver<bool>) -> Result<RunReport> {
        let pool = self.pool.clone();
        self.run_date_with(date, cancel, move |tx| OperatorExecutor::new(pool, tx))
            .await
    }

    /// Like [`Self::run_date`], with a custom executor built from the Run's
    /// event sender.
    pub async fn run_date_with<E, F>(
        &self,
        date: NaiveDate,
        cancel: watch::Receiver<bool>,
        make_executor: F,
    ) -> Result<RunReport>
    where
        E: ExecutorBackend,
        F: FnOnce(mpsc::Sender<RunEvent>) -> E,
    {
        let (tx, rx) = mpsc::channel::<RunEvent>(64);
        let executor = make_executor(tx);

        let core = CoreRuntime::new(Arc::clone(&self.scheduler), date);
        let runtime = Runtime::new(core, rx, executor, Arc::clone(&self.alerts), cancel);
        let outcome = runtime.run().await?;

        Ok(RunReport {
            dag_id: self.graph().dag_id().to_string(),
            logical_date: date,
            outcome,
            instances: self.scheduler.instances(date)?,
        })
    }
}
