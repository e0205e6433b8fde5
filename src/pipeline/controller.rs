use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use super::catalog::{CatalogEntry, ProcessCatalog};
use super::error::ControllerError;
use super::events::Observer;
use super::executor::{
    CancellationToken, FailurePolicy, JobExecutor, OutputTarget, RunReport, RunRequest,
};
use super::gate::ExecutionGate;
use super::plugin::PluginRegistry;
use crate::store::ConfigStore;

/// Handle for one spawned run.
struct Worker {
    row_id: u32,
    cancel: CancellationToken,
    handle: JoinHandle<RunReport>,
}

/// Coordination facade used by the host (CLI, GUI).
///
/// Every run gets its own worker thread, but all workers share one
/// [`ExecutionGate`], so runs execute one after another in submission order of
/// gate acquisition.
pub struct Controller {
    catalog: Arc<ProcessCatalog>,
    registry: Arc<PluginRegistry>,
    store: Arc<dyn ConfigStore>,
    gate: Arc<ExecutionGate>,
    config_group: String,
    datafile_marker: String,
    policy: FailurePolicy,
    runtime: BTreeMap<String, String>,
    workers: Mutex<Vec<Worker>>,
}

impl Controller {
    pub fn new(
        catalog: Arc<ProcessCatalog>,
        registry: Arc<PluginRegistry>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        for binding in registry.missing(&catalog) {
            log::warn!("Catalog refers to {binding}, which has no registered unit");
        }
        Self {
            catalog,
            registry,
            store,
            gate: ExecutionGate::global(),
            config_group: "default".to_string(),
            datafile_marker: String::new(),
            policy: FailurePolicy::default(),
            runtime: BTreeMap::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Use a private gate instead of the process-wide one.
    pub fn with_gate(mut self, gate: Arc<ExecutionGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_config_group(mut self, group: impl Into<String>) -> Self {
        self.config_group = group.into();
        self
    }

    pub fn with_datafile_marker(mut self, marker: impl Into<String>) -> Self {
        self.datafile_marker = marker.into();
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_runtime(mut self, runtime: BTreeMap<String, String>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn list_catalog(&self) -> &[CatalogEntry] {
        self.catalog.entries()
    }

    pub fn config_group(&self) -> &str {
        &self.config_group
    }

    /// Switch the configuration profile used by subsequent runs.
    pub fn set_config_group(&mut self, group: impl Into<String>) {
        self.config_group = group.into();
    }

    pub fn is_busy(&self) -> bool {
        self.gate.is_busy()
    }

    /// Start a run on a new worker thread and return immediately.
    ///
    /// Progress and completion arrive only through `observer`.
    pub fn run_job(
        &self,
        entry_id: &str,
        files: Vec<PathBuf>,
        output: OutputTarget,
        row_id: u32,
        observer: Arc<dyn Observer>,
    ) -> Result<(), ControllerError> {
        let entry = self
            .catalog
            .get(entry_id)
            .cloned()
            .ok_or_else(|| ControllerError::UnknownEntry(entry_id.to_string()))?;

        log::info!(
            "Running thread - start: {} ({}) [row: {}] {} files",
            entry.caption,
            entry.kind,
            row_id,
            files.len()
        );

        let request = RunRequest {
            entry_id: entry_id.to_string(),
            files,
            output,
            row_id,
            config_group: self.config_group.clone(),
            runtime: self.runtime.clone(),
        };

        let cancel = CancellationToken::new();
        let executor = JobExecutor::new(
            entry,
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            Arc::clone(&self.gate),
            observer,
        )
        .with_datafile_marker(self.datafile_marker.clone())
        .with_failure_policy(self.policy)
        .with_cancellation(cancel.clone());

        let handle = thread::Builder::new()
            .name(format!("run-{row_id}"))
            .spawn(move || executor.execute(request))?;

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        reap_finished(&mut workers);
        workers.push(Worker {
            row_id,
            cancel,
            handle,
        });
        Ok(())
    }

    /// Ask every live worker other than the calling thread to stop.
    ///
    /// Best-effort: a worker stops before its next file; the file in flight
    /// is not interrupted.
    pub fn shutdown(&self) {
        let me = thread::current().id();
        let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for worker in workers.iter() {
            if worker.handle.thread().id() != me && !worker.handle.is_finished() {
                log::info!("Shutdown: closing run for row {}", worker.row_id);
                worker.cancel.cancel();
            }
        }
    }

    /// Block until every spawned worker has finished, returning their reports.
    /// A worker that panicked contributes no report.
    pub fn wait(&self) -> Vec<RunReport> {
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        workers
            .into_iter()
            .filter_map(|w| match w.handle.join() {
                Ok(report) => Some(report),
                Err(_) => {
                    log::error!("Run for row {} panicked", w.row_id);
                    None
                }
            })
            .collect()
    }
}

/// Drop handles of workers that already exited.
fn reap_finished(workers: &mut Vec<Worker>) {
    let (done, live): (Vec<_>, Vec<_>) = std::mem::take(workers)
        .into_iter()
        .partition(|w| w.handle.is_finished());
    *workers = live;
    for w in done {
        if w.handle.join().is_err() {
            log::error!("Run for row {} panicked", w.row_id);
        }
    }
}
