//! Runs one catalog entry over a file set.
//!
//! ```text
//! Idle ─acquire gate─▶ Resolving ─▶ Dispatching ─▶ PerFile(1..n) ─▶ Completed
//!                          │                           │
//!                          └──────────── error ────────┴──────────▶ Failed / Cancelled
//! ```
//!
//! Every exit path drops the gate guard, so the next queued run can start.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;

use super::catalog::CatalogEntry;
use super::error::RunError;
use super::events::{Observer, ProgressEvent};
use super::gate::ExecutionGate;
use super::matcher;
use super::plugin::{Configurables, PluginRegistry, UnitContext, UnitOutput};
use crate::store::ConfigStore;

// ---------------------------------------------------------------------------
// Request / report types
// ---------------------------------------------------------------------------

/// Where a unit writes its results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Directory(PathBuf),
    /// A `processed` directory next to each primary file.
    Local,
}

impl OutputTarget {
    pub const LOCAL_DIR: &'static str = "processed";

    /// Output directory for `file`, created if missing.
    pub fn dir_for(&self, file: &Path) -> Result<PathBuf, RunError> {
        let dir = match self {
            OutputTarget::Directory(dir) => dir.clone(),
            OutputTarget::Local => file
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(Self::LOCAL_DIR),
        };
        std::fs::create_dir_all(&dir).map_err(|source| RunError::OutputDir {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }
}

/// One user-initiated run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub entry_id: String,
    pub files: Vec<PathBuf>,
    pub output: OutputTarget,
    /// Correlation token echoed in every progress event.
    pub row_id: u32,
    /// Configuration group roles and parameters are resolved against.
    pub config_group: String,
    /// Base configuration passed to every unit at construction.
    pub runtime: BTreeMap<String, String>,
}

/// What to do when a single file fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Emit the failure event and skip every remaining file.
    #[default]
    AbortRun,
    /// Record the failure for that file and carry on.
    SkipFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Resolving,
    Dispatching,
    PerFile { index: usize },
    Completed,
    Failed,
    Cancelled,
}

/// Result recorded for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Completed(UnitOutput),
    /// The unit found nothing to process; not an error.
    NoData,
    /// Only recorded under [`FailurePolicy::SkipFile`].
    Failed(String),
}

/// Summary of a finished run. Hosts observe runs through events; this is for
/// logging and for callers driving an executor directly.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub job_name: String,
    pub row_id: u32,
    pub state: JobState,
    /// Per-file outcomes in processing order.
    pub results: Vec<(PathBuf, FileOutcome)>,
    pub error: Option<String>,
}

impl RunReport {
    pub fn outcome(&self, file: &Path) -> Option<&FileOutcome> {
        self.results
            .iter()
            .find(|(f, _)| f == file)
            .map(|(_, outcome)| outcome)
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Shared stop flag, checked between files.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// JobExecutor
// ---------------------------------------------------------------------------

pub struct JobExecutor {
    entry: CatalogEntry,
    registry: Arc<PluginRegistry>,
    store: Arc<dyn ConfigStore>,
    gate: Arc<ExecutionGate>,
    observer: Arc<dyn Observer>,
    datafile_marker: String,
    policy: FailurePolicy,
    cancel: CancellationToken,
    state: JobState,
}

impl JobExecutor {
    pub fn new(
        entry: CatalogEntry,
        registry: Arc<PluginRegistry>,
        store: Arc<dyn ConfigStore>,
        gate: Arc<ExecutionGate>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            entry,
            registry,
            store,
            gate,
            observer,
            datafile_marker: String::new(),
            policy: FailurePolicy::default(),
            cancel: CancellationToken::new(),
            state: JobState::Idle,
        }
    }

    /// Marker string a resolved companion path must contain to be processed.
    pub fn with_datafile_marker(mut self, marker: impl Into<String>) -> Self {
        self.datafile_marker = marker.into();
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the request to completion. Blocks until the gate is free.
    pub fn execute(mut self, request: RunRequest) -> RunReport {
        let job_name = self.entry.caption.clone();
        let row_id = request.row_id;

        let gate = Arc::clone(&self.gate);
        let _guard = gate.acquire(&job_name, row_id);

        self.transition(JobState::Resolving);
        let files = match self.resolve(&request) {
            Ok(files) => files,
            Err(e) => {
                log::error!("{job_name}: {e}");
                self.emit(ProgressEvent::failed(row_id, 0, request.files.len(), &job_name));
                return self.finish(JobState::Failed, Vec::new(), Some(e.to_string()), row_id);
            }
        };

        let total = files.len();
        log::info!(
            "Checked by type ({}): {} files loaded\n\t{}",
            job_name,
            total,
            files
                .iter()
                .map(|f| f.display().to_string())
                .collect::<Vec<_>>()
                .join("\n\t")
        );

        self.transition(JobState::Dispatching);
        let mut results = Vec::with_capacity(total);

        for (idx, file) in files.iter().enumerate() {
            let index = idx + 1;
            if self.cancel.is_cancelled() {
                log::warn!("{job_name}: cancelled before file {index} of {total}");
                self.emit(ProgressEvent::failed(row_id, idx, total, &job_name));
                return self.finish(JobState::Cancelled, results, Some("cancelled".into()), row_id);
            }

            self.transition(JobState::PerFile { index });
            self.emit(ProgressEvent::step(row_id, index, total, &job_name));

            match self.process_guarded(file, &request) {
                Ok(outcome) => results.push((file.clone(), outcome)),
                Err(e) => match self.policy {
                    FailurePolicy::AbortRun => {
                        log::error!("{job_name}: {e}");
                        self.emit(ProgressEvent::failed(row_id, index, total, &job_name));
                        return self.finish(JobState::Failed, results, Some(e.to_string()), row_id);
                    }
                    FailurePolicy::SkipFile => {
                        log::warn!("{job_name}: skipping {}: {e}", file.display());
                        results.push((file.clone(), FileOutcome::Failed(e.to_string())));
                    }
                },
            }
        }

        self.emit(ProgressEvent::complete(row_id, total, &job_name));
        self.finish(JobState::Completed, results, None, row_id)
    }

    fn resolve(&self, request: &RunRequest) -> Result<Vec<PathBuf>, RunError> {
        if self.entry.required_roles.is_empty() {
            return Ok(request.files.clone());
        }
        let fragments =
            matcher::resolve_roles(self.store.as_ref(), &request.config_group, &self.entry.required_roles)?;
        log::debug!("{}: role fragments {:?}", self.entry.caption, fragments);
        Ok(matcher::effective_files(&request.files, &fragments, &self.datafile_marker)?)
    }

    /// Process one file, turning a panicking unit into an ordinary error.
    fn process_guarded(&self, file: &Path, request: &RunRequest) -> Result<FileOutcome, RunError> {
        panic::catch_unwind(AssertUnwindSafe(|| self.process_file(file, request))).unwrap_or_else(
            |payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(RunError::Panicked {
                    file: file.to_path_buf(),
                    message,
                })
            },
        )
    }

    fn process_file(&self, file: &Path, request: &RunRequest) -> Result<FileOutcome, RunError> {
        log::info!("{} with file: {}", self.entry.caption, file.display());

        let binding = &self.entry.binding;
        let factory = self.registry.get(binding).ok_or_else(|| RunError::UnknownBinding {
            module: binding.module.clone(),
            class: binding.class.clone(),
        })?;

        let ctx = UnitContext {
            primary_file: file.to_path_buf(),
            output_dir: request.output.dir_for(file)?,
            runtime: request.runtime.clone(),
        };
        let instantiation = |source| RunError::Instantiation {
            file: file.to_path_buf(),
            source,
        };

        let mut unit = factory.instantiate(&ctx).map_err(instantiation)?;

        let mut values = Configurables::new();
        for key in unit.configurable_keys() {
            let value = self.store.lookup(&request.config_group, &key)?;
            log::debug!("config set: {key}={value:?}");
            values.insert(key, value);
        }
        unit.set_configurables(values).map_err(instantiation)?;

        if !unit.has_data() {
            log::info!("No data in {}", file.display());
            return Ok(FileOutcome::NoData);
        }

        let output = unit.run().map_err(|source| RunError::Execution {
            file: file.to_path_buf(),
            source,
        })?;
        Ok(FileOutcome::Completed(output))
    }

    fn emit(&self, event: ProgressEvent) {
        log::debug!(
            "{}: {}% ({} of {})",
            event.job_name,
            event.percent,
            event.current,
            event.total
        );
        self.observer.notify(&event);
    }

    fn transition(&mut self, next: JobState) {
        log::debug!("{}: {:?} -> {:?}", self.entry.caption, self.state, next);
        self.state = next;
    }

    fn finish(
        &mut self,
        state: JobState,
        results: Vec<(PathBuf, FileOutcome)>,
        error: Option<String>,
        row_id: u32,
    ) -> RunReport {
        self.transition(state);
        log::info!("Finished {} [row {}]: {:?}", self.entry.caption, row_id, state);
        RunReport {
            job_name: self.entry.caption.clone(),
            row_id,
            state,
            results,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::catalog::PluginBinding;
    use crate::pipeline::events::{Stage, COMPLETE, FAILED};
    use crate::pipeline::plugin::ProcessUnit;
    use crate::store::MemoryConfigStore;
    use std::collections::{BTreeSet, HashSet};
    use std::sync::{mpsc, Mutex};
    use std::thread;
    use std::time::Duration;

    // -- scripted unit --------------------------------------------------------

    #[derive(Default)]
    struct Script {
        fail_instantiate: HashSet<String>,
        fail_run: HashSet<String>,
        panic_run: HashSet<String>,
        no_data: HashSet<String>,
        keys: Vec<&'static str>,
        run_delay: Option<Duration>,
        cancel_after_run: Option<CancellationToken>,
        /// (file name, configurables, output dir) per instantiated unit
        seen: Mutex<Vec<(String, Configurables, PathBuf)>>,
        ran: Mutex<Vec<String>>,
    }

    struct ScriptedUnit {
        name: String,
        output_dir: PathBuf,
        script: Arc<Script>,
    }

    impl ProcessUnit for ScriptedUnit {
        fn configurable_keys(&self) -> BTreeSet<String> {
            self.script.keys.iter().map(|k| k.to_string()).collect()
        }

        fn set_configurables(&mut self, values: Configurables) -> anyhow::Result<()> {
            self.script.seen.lock().unwrap().push((
                self.name.clone(),
                values,
                self.output_dir.clone(),
            ));
            Ok(())
        }

        fn has_data(&self) -> bool {
            !self.script.no_data.contains(&self.name)
        }

        fn run(&mut self) -> anyhow::Result<UnitOutput> {
            if let Some(delay) = self.script.run_delay {
                thread::sleep(delay);
            }
            if self.script.panic_run.contains(&self.name) {
                panic!("unit exploded on {}", self.name);
            }
            self.script.ran.lock().unwrap().push(self.name.clone());
            if let Some(token) = &self.script.cancel_after_run {
                token.cancel();
            }
            if self.script.fail_run.contains(&self.name) {
                anyhow::bail!("bad column in {}", self.name);
            }
            Ok(UnitOutput {
                artifacts: vec![self.output_dir.join(format!("{}_OUT.csv", self.name))],
                summary: None,
            })
        }
    }

    fn binding() -> PluginBinding {
        PluginBinding::new("tests", "Scripted")
    }

    fn registry(script: Arc<Script>) -> Arc<PluginRegistry> {
        let mut registry = PluginRegistry::new();
        registry.register(binding(), move |ctx: &UnitContext| -> anyhow::Result<Box<dyn ProcessUnit>> {
            let name = ctx
                .primary_file
                .file_name()
                .unwrap()
                .to_string_lossy()
                .into_owned();
            if script.fail_instantiate.contains(&name) {
                anyhow::bail!("cannot open {name}");
            }
            Ok(Box::new(ScriptedUnit {
                name,
                output_dir: ctx.output_dir.clone(),
                script: Arc::clone(&script),
            }))
        });
        Arc::new(registry)
    }

    fn entry(roles: &[&str]) -> CatalogEntry {
        CatalogEntry {
            id: "scripted".into(),
            caption: "Scripted".into(),
            kind: "test".into(),
            binding: binding(),
            required_roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    fn recorder() -> (Arc<dyn Observer>, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let observer: Arc<dyn Observer> =
            Arc::new(move |e: &ProgressEvent| sink.lock().unwrap().push(e.clone()));
        (observer, events)
    }

    fn request(files: &[&str], out: &Path) -> RunRequest {
        RunRequest {
            entry_id: "scripted".into(),
            files: files.iter().map(PathBuf::from).collect(),
            output: OutputTarget::Directory(out.to_path_buf()),
            row_id: 4,
            config_group: "default".into(),
            runtime: BTreeMap::new(),
        }
    }

    fn executor(
        script: Arc<Script>,
        roles: &[&str],
        store: MemoryConfigStore,
        gate: Arc<ExecutionGate>,
        observer: Arc<dyn Observer>,
    ) -> JobExecutor {
        JobExecutor::new(entry(roles), registry(script), Arc::new(store), gate, observer)
    }

    fn shape(events: &[ProgressEvent]) -> Vec<(Stage, i32, usize, usize)> {
        events
            .iter()
            .map(|e| (e.stage, e.percent, e.current, e.total))
            .collect()
    }

    // -- scenarios ------------------------------------------------------------

    #[test]
    fn two_files_without_roles_complete() {
        let out = tempfile::tempdir().unwrap();
        let script = Arc::new(Script::default());
        let (observer, events) = recorder();
        let gate = Arc::new(ExecutionGate::new());

        let report = executor(script.clone(), &[], MemoryConfigStore::new(), gate, observer)
            .execute(request(&["A.csv", "B.csv"], out.path()));

        assert_eq!(
            shape(&events.lock().unwrap()),
            vec![
                (Stage::Step, 50, 1, 2),
                (Stage::Step, 100, 2, 2),
                (Stage::Completed, COMPLETE, 2, 2)
            ]
        );
        assert!(events.lock().unwrap().iter().all(|e| e.row_id == 4 && e.job_name == "Scripted"));
        assert_eq!(report.state, JobState::Completed);
        assert!(matches!(report.outcome(Path::new("A.csv")), Some(FileOutcome::Completed(_))));
        assert!(matches!(report.outcome(Path::new("B.csv")), Some(FileOutcome::Completed(_))));
        assert_eq!(*script.ran.lock().unwrap(), ["A.csv", "B.csv"]);
    }

    #[test]
    fn success_steps_cover_every_index_once() {
        let out = tempfile::tempdir().unwrap();
        let names: Vec<String> = (0..7).map(|i| format!("f{i}.csv")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let (observer, events) = recorder();

        executor(
            Arc::new(Script::default()),
            &[],
            MemoryConfigStore::new(),
            Arc::new(ExecutionGate::new()),
            observer,
        )
        .execute(request(&refs, out.path()));

        let events = events.lock().unwrap();
        let steps: Vec<_> = events.iter().filter(|e| e.stage == Stage::Step).collect();
        assert_eq!(steps.iter().map(|e| e.current).collect::<Vec<_>>(), (1..=7).collect::<Vec<_>>());
        assert!(steps.windows(2).all(|w| w[0].percent <= w[1].percent));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(events.last().unwrap().percent, COMPLETE);
    }

    #[test]
    fn instantiation_failure_on_second_file_aborts() {
        let out = tempfile::tempdir().unwrap();
        let script = Arc::new(Script {
            fail_instantiate: HashSet::from(["B.csv".to_string()]),
            ..Script::default()
        });
        let (observer, events) = recorder();
        let gate = Arc::new(ExecutionGate::new());

        let report = executor(script, &[], MemoryConfigStore::new(), gate.clone(), observer)
            .execute(request(&["A.csv", "B.csv"], out.path()));

        assert_eq!(
            shape(&events.lock().unwrap()),
            vec![(Stage::Step, 50, 1, 2), (Stage::Failed, FAILED, 2, 2)]
        );
        assert_eq!(report.state, JobState::Failed);
        assert!(report.error.unwrap().contains("cannot open B.csv"));
        assert!(gate.try_acquire("next", 0).is_some());
    }

    #[test]
    fn execution_failure_skips_remaining_files() {
        let out = tempfile::tempdir().unwrap();
        let script = Arc::new(Script {
            fail_run: HashSet::from(["A.csv".to_string()]),
            ..Script::default()
        });
        let (observer, events) = recorder();

        let report = executor(
            script.clone(),
            &[],
            MemoryConfigStore::new(),
            Arc::new(ExecutionGate::new()),
            observer,
        )
        .execute(request(&["A.csv", "B.csv", "C.csv"], out.path()));

        assert_eq!(
            shape(&events.lock().unwrap()),
            vec![(Stage::Step, 33, 1, 3), (Stage::Failed, FAILED, 1, 3)]
        );
        assert_eq!(*script.ran.lock().unwrap(), ["A.csv"]);
        assert!(report.results.is_empty());
    }

    #[test]
    fn skip_file_policy_continues_past_failures() {
        let out = tempfile::tempdir().unwrap();
        let script = Arc::new(Script {
            fail_run: HashSet::from(["A.csv".to_string()]),
            ..Script::default()
        });
        let (observer, events) = recorder();

        let report = executor(
            script,
            &[],
            MemoryConfigStore::new(),
            Arc::new(ExecutionGate::new()),
            observer,
        )
        .with_failure_policy(FailurePolicy::SkipFile)
        .execute(request(&["A.csv", "B.csv"], out.path()));

        assert_eq!(report.state, JobState::Completed);
        assert!(matches!(report.outcome(Path::new("A.csv")), Some(FileOutcome::Failed(m)) if m.contains("bad column")));
        assert!(matches!(report.outcome(Path::new("B.csv")), Some(FileOutcome::Completed(_))));
        assert_eq!(events.lock().unwrap().last().unwrap().stage, Stage::Completed);
    }

    #[test]
    fn no_data_is_not_an_error() {
        let out = tempfile::tempdir().unwrap();
        let script = Arc::new(Script {
            no_data: HashSet::from(["A.csv".to_string()]),
            ..Script::default()
        });
        let (observer, events) = recorder();

        let report = executor(
            script.clone(),
            &[],
            MemoryConfigStore::new(),
            Arc::new(ExecutionGate::new()),
            observer,
        )
        .execute(request(&["A.csv", "B.csv"], out.path()));

        assert_eq!(report.outcome(Path::new("A.csv")), Some(&FileOutcome::NoData));
        assert_eq!(*script.ran.lock().unwrap(), ["B.csv"]);
        assert_eq!(events.lock().unwrap().last().unwrap().percent, COMPLETE);
    }

    #[test]
    fn configurables_resolve_against_run_group() {
        let out = tempfile::tempdir().unwrap();
        let script = Arc::new(Script {
            keys: vec!["BINWIDTH", "COLUMN"],
            ..Script::default()
        });
        let store = MemoryConfigStore::new()
            .with("default", "BINWIDTH", "10")
            .with("other", "COLUMN", "Area");
        let (observer, _) = recorder();

        executor(script.clone(), &[], store, Arc::new(ExecutionGate::new()), observer)
            .execute(request(&["A.csv"], out.path()));

        let seen = script.seen.lock().unwrap();
        let (_, values, dir) = &seen[0];
        assert_eq!(values.get("BINWIDTH"), Some(&Some("10".to_string())));
        assert_eq!(values.get("COLUMN"), Some(&None));
        assert_eq!(dir, out.path());
    }

    #[test]
    fn roles_narrow_to_marked_data_files() {
        let root = tempfile::tempdir().unwrap();
        let a = root.path().join("a").join("A_Image.csv");
        let msd = root.path().join("a").join("MSD.txt");
        std::fs::create_dir_all(a.parent().unwrap()).unwrap();
        std::fs::write(&a, "x\n").unwrap();
        std::fs::write(&msd, "x\n").unwrap();

        let script = Arc::new(Script::default());
        let store = MemoryConfigStore::new().with("default", "DATAFILE", "_Image.csv");
        let (observer, events) = recorder();

        let mut req = request(&[], root.path());
        req.files = vec![a.clone(), msd.clone()];
        req.output = OutputTarget::Local;

        let report = executor(
            script.clone(),
            &["DATAFILE", "MSD.txt"],
            store,
            Arc::new(ExecutionGate::new()),
            observer,
        )
        .with_datafile_marker("_Image")
        .execute(req);

        // the MSD.txt role pulls in MSD.txt twice; the marker drops both
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].0, a);
        assert_eq!(events.lock().unwrap().len(), 2);

        let seen = script.seen.lock().unwrap();
        assert_eq!(seen[0].2, root.path().join("a").join(OutputTarget::LOCAL_DIR));
        assert!(seen[0].2.is_dir());
    }

    #[test]
    fn unmatched_role_fails_before_any_file() {
        let root = tempfile::tempdir().unwrap();
        let a = root.path().join("A_Image.csv");
        std::fs::write(&a, "x\n").unwrap();

        let script = Arc::new(Script::default());
        let (observer, events) = recorder();
        let mut req = request(&[], root.path());
        req.files = vec![a];

        let report = executor(
            script.clone(),
            &["MISSING.txt"],
            MemoryConfigStore::new(),
            Arc::new(ExecutionGate::new()),
            observer,
        )
        .execute(req);

        assert_eq!(shape(&events.lock().unwrap()), vec![(Stage::Failed, FAILED, 0, 1)]);
        assert_eq!(report.state, JobState::Failed);
        assert!(script.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_file_set_completes_immediately() {
        let out = tempfile::tempdir().unwrap();
        let (observer, events) = recorder();
        executor(
            Arc::new(Script::default()),
            &[],
            MemoryConfigStore::new(),
            Arc::new(ExecutionGate::new()),
            observer,
        )
        .execute(request(&[], out.path()));

        assert_eq!(shape(&events.lock().unwrap()), vec![(Stage::Completed, COMPLETE, 0, 0)]);
    }

    #[test]
    fn unknown_binding_fails_the_file() {
        let out = tempfile::tempdir().unwrap();
        let (observer, events) = recorder();
        let exec = JobExecutor::new(
            entry(&[]),
            Arc::new(PluginRegistry::new()),
            Arc::new(MemoryConfigStore::new()),
            Arc::new(ExecutionGate::new()),
            observer,
        );
        let report = exec.execute(request(&["A.csv"], out.path()));
        assert!(report.error.unwrap().contains("tests.Scripted"));
        assert_eq!(events.lock().unwrap().last().unwrap().stage, Stage::Failed);
    }

    #[test]
    fn panicking_unit_becomes_failure_event() {
        let out = tempfile::tempdir().unwrap();
        let script = Arc::new(Script {
            panic_run: HashSet::from(["A.csv".to_string()]),
            ..Script::default()
        });
        let (observer, events) = recorder();
        let gate = Arc::new(ExecutionGate::new());

        let report = executor(script, &[], MemoryConfigStore::new(), gate.clone(), observer)
            .execute(request(&["A.csv"], out.path()));

        assert!(report.error.unwrap().contains("unit exploded on A.csv"));
        assert_eq!(shape(&events.lock().unwrap())[1], (Stage::Failed, FAILED, 1, 1));
        assert!(!gate.is_busy());
    }

    #[test]
    fn cancellation_stops_between_files() {
        let out = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let script = Arc::new(Script {
            cancel_after_run: Some(token.clone()),
            ..Script::default()
        });
        let (observer, events) = recorder();

        let report = executor(
            script.clone(),
            &[],
            MemoryConfigStore::new(),
            Arc::new(ExecutionGate::new()),
            observer,
        )
        .with_cancellation(token)
        .execute(request(&["A.csv", "B.csv", "C.csv"], out.path()));

        assert_eq!(report.state, JobState::Cancelled);
        assert_eq!(
            shape(&events.lock().unwrap()),
            vec![(Stage::Step, 33, 1, 3), (Stage::Failed, FAILED, 1, 3)]
        );
        assert_eq!(*script.ran.lock().unwrap(), ["A.csv"]);
    }

    #[test]
    fn panicking_observer_still_releases_gate() {
        let out = tempfile::tempdir().unwrap();
        let gate = Arc::new(ExecutionGate::new());
        let observer: Arc<dyn Observer> = Arc::new(|_: &ProgressEvent| panic!("observer down"));
        let exec = executor(
            Arc::new(Script::default()),
            &[],
            MemoryConfigStore::new(),
            gate.clone(),
            observer,
        );
        let req = request(&["A.csv"], out.path());

        let joined = thread::spawn(move || exec.execute(req)).join();
        assert!(joined.is_err());
        assert!(!gate.is_busy());
        assert!(gate.try_acquire("next", 0).is_some());
    }

    #[test]
    fn concurrent_runs_do_not_interleave() {
        let out = tempfile::tempdir().unwrap();
        let gate = Arc::new(ExecutionGate::new());
        let (tx, rx) = mpsc::channel::<ProgressEvent>();
        let observer: Arc<dyn Observer> = Arc::new(crate::pipeline::events::ChannelObserver::new(tx));
        let script = Arc::new(Script {
            run_delay: Some(Duration::from_millis(5)),
            ..Script::default()
        });

        let handles: Vec<_> = (0..2u32)
            .map(|row| {
                let exec = executor(
                    script.clone(),
                    &[],
                    MemoryConfigStore::new(),
                    gate.clone(),
                    observer.clone(),
                );
                let mut req = request(&["A.csv", "B.csv", "C.csv"], out.path());
                req.row_id = row;
                thread::spawn(move || exec.execute(req))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        drop(observer);

        let events: Vec<ProgressEvent> = rx.iter().collect();
        assert_eq!(events.len(), 8);
        // each run's four events are contiguous and end with its terminal event
        for chunk in events.chunks(4) {
            assert!(chunk.iter().all(|e| e.row_id == chunk[0].row_id));
            assert_eq!(chunk[3].stage, Stage::Completed);
        }
        assert_ne!(events[0].row_id, events[4].row_id);
    }
}
