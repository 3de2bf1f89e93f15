use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use rayon::ThreadPoolBuilder;
use toml::Table;
use tracing::{debug, info, warn};

use crate::error::{Result, TomoError};
use crate::ledger::{RecordStatus, RecordUpdate, StageLedger};
use crate::params::{MasterConfig, Overrides, ParameterStore, StageConfig};
use crate::project::Project;
use crate::registry::{Artifacts, MasterRegistry, RegistryEntry, UnitId, UnitRegistry};
use crate::stage::Stage;
use crate::tools::{ExecContext, FailureKind, ToolAdapter, ToolFailure};

use super::process_list::{self, ProcessList};
use super::types::{CancelToken, NoOpReporter, ProgressReporter};

/// Outcome of one stage run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunReport {
    pub stage: Stage,
    /// Size of the process list.
    pub candidates: usize,
    /// Units that entered `in_progress` in this run.
    pub attempted: usize,
    pub completed: Vec<UnitId>,
    pub failed: Vec<(UnitId, ToolFailure)>,
    /// Units never dispatched because the run was cancelled.
    pub not_started: Vec<UnitId>,
    /// Eligible units left alone because they were already completed.
    pub skipped_completed: Vec<UnitId>,
    pub cancelled: bool,
}

impl RunReport {
    fn new(stage: Stage, list: &ProcessList) -> Self {
        Self {
            stage,
            candidates: list.len(),
            attempted: 0,
            completed: Vec::new(),
            failed: Vec::new(),
            not_started: Vec::new(),
            skipped_completed: list.skipped_completed.clone(),
            cancelled: false,
        }
    }

    pub fn finished(&self) -> usize {
        self.completed.len() + self.failed.len()
    }

    /// Every candidate of the run failed.
    pub fn is_total_failure(&self) -> bool {
        self.candidates > 0 && self.failed.len() == self.candidates
    }
}

enum WorkerEvent {
    /// The worker waits for the acknowledgement, sent once the `in_progress`
    /// record is on disk, before it runs the adapter.
    Started(UnitId, Sender<()>),
    Finished(UnitId, std::result::Result<Artifacts, ToolFailure>),
    Skipped(UnitId),
}

/// Dispatches a process list to a tool adapter on a bounded worker pool.
///
/// Workers only run the adapter; every ledger write happens on the calling
/// thread as worker events arrive.
pub struct StageRunner {
    config: Arc<StageConfig>,
    adapter: Arc<dyn ToolAdapter>,
    cancel: CancelToken,
    reporter: Arc<dyn ProgressReporter>,
}

impl StageRunner {
    pub fn new(config: StageConfig, adapter: Arc<dyn ToolAdapter>) -> Self {
        Self {
            config: Arc::new(config),
            adapter,
            cancel: CancelToken::new(),
            reporter: Arc::new(NoOpReporter),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Run every unit of `list` and record the outcomes in `ledger`.
    ///
    /// The ledger is persisted to `ledger_path` before dispatch (every
    /// candidate then has a `pending`, `in_progress` or reset record), each
    /// time a unit starts, every `checkpoint_interval` finished units and
    /// once at the end.
    pub fn run(
        &self,
        registry: &UnitRegistry,
        list: &ProcessList,
        ledger: &mut StageLedger,
        ledger_path: &Path,
    ) -> Result<RunReport> {
        let stage = self.config.stage;
        if ledger.stage() != stage {
            return Err(TomoError::config(
                "ledger",
                format!("{} ledger passed to a {stage} run", ledger.stage()),
            ));
        }
        let snapshot = self.config.snapshot()?;
        let entries = list
            .units
            .iter()
            .map(|id| registry.by_id(id).cloned())
            .collect::<Result<Vec<_>>>()?;

        let mut report = RunReport::new(stage, list);
        let parallelism = self.config.system.parallelism;
        info!(
            stage = stage.key(),
            units = entries.len(),
            already_completed = list.skipped_completed.len(),
            parallelism,
            "Stage run started"
        );
        self.reporter.begin_stage(stage, entries.len());

        if !entries.is_empty() {
            let pool = ThreadPoolBuilder::new()
                .num_threads(parallelism)
                .thread_name(move |i| format!("tomoflow-{}-{i}", stage.key()))
                .build()
                .map_err(|e| TomoError::config("system.parallelism", e.to_string()))?;
            prepare(ledger, &list.units, &snapshot)?;
            ledger.persist(ledger_path)?;

            let abort = CancelToken::new();
            let (tx, rx) = mpsc::channel();

            pool.in_place_scope(|scope| {
                for entry in entries {
                    let tx = tx.clone();
                    let cancel = self.cancel.clone();
                    let abort = abort.clone();
                    let adapter = Arc::clone(&self.adapter);
                    let config = Arc::clone(&self.config);
                    scope.spawn(move |_| {
                        let id = entry.id().clone();
                        if cancel.is_cancelled() || abort.is_cancelled() {
                            let _ = tx.send(WorkerEvent::Skipped(id));
                            return;
                        }
                        let (ack_tx, ack_rx) = mpsc::channel();
                        if tx.send(WorkerEvent::Started(id.clone(), ack_tx)).is_err()
                            || ack_rx.recv().is_err()
                        {
                            return;
                        }
                        let execution = execute_unit(adapter, entry, config);
                        let _ = tx.send(WorkerEvent::Finished(id, execution.outcome));
                        // Keep the pool slot until a timed-out adapter returns.
                        if let Some(handle) = execution.abandoned {
                            let _ = handle.join();
                        }
                    });
                }
                drop(tx);
                let collected = self.collect(rx, ledger, ledger_path, &snapshot, &mut report);
                if collected.is_err() {
                    abort.cancel();
                }
                collected
            })?;
        }

        report.cancelled = self.cancel.is_cancelled();
        ledger.persist(ledger_path)?;
        self.reporter.finish_stage();
        info!(
            stage = stage.key(),
            completed = report.completed.len(),
            failed = report.failed.len(),
            not_started = report.not_started.len(),
            cancelled = report.cancelled,
            "Stage run finished"
        );
        Ok(report)
    }

    /// Drain worker events into the ledger until every job has reported.
    fn collect(
        &self,
        rx: Receiver<WorkerEvent>,
        ledger: &mut StageLedger,
        ledger_path: &Path,
        snapshot: &Table,
        report: &mut RunReport,
    ) -> Result<()> {
        let interval = self.config.system.checkpoint_interval;
        let mut since_checkpoint = 0;
        for event in rx {
            match event {
                WorkerEvent::Started(id, ack) => {
                    let rec = ledger.record(&id, RecordUpdate::InProgress, snapshot)?;
                    debug!(unit = %id, attempt = rec.attempts, "Unit started");
                    report.attempted += 1;
                    ledger.persist(ledger_path)?;
                    let _ = ack.send(());
                }
                WorkerEvent::Finished(id, Ok(artifacts)) => {
                    ledger.record(&id, RecordUpdate::Completed(artifacts), snapshot)?;
                    debug!(unit = %id, "Unit completed");
                    report.completed.push(id.clone());
                    self.reporter.unit_finished(&id, None, report.finished());
                    since_checkpoint += 1;
                }
                WorkerEvent::Finished(id, Err(failure)) => {
                    warn!(unit = %id, error = %failure, "Unit failed");
                    ledger.record(&id, RecordUpdate::Failed(failure.clone()), snapshot)?;
                    self.reporter
                        .unit_finished(&id, Some(&failure), report.finished() + 1);
                    report.failed.push((id, failure));
                    since_checkpoint += 1;
                }
                WorkerEvent::Skipped(id) => {
                    debug!(unit = %id, "Run cancelled, unit not started");
                    report.not_started.push(id);
                }
            }
            if since_checkpoint >= interval {
                ledger.persist(ledger_path)?;
                since_checkpoint = 0;
            }
        }
        Ok(())
    }
}

/// Give every candidate a record the builder would select again after a
/// crash: absent units become `pending` and failed ones are reset.
fn prepare(ledger: &mut StageLedger, units: &[UnitId], snapshot: &Table) -> Result<()> {
    for id in units {
        match ledger.status_of(id) {
            None => {
                ledger.record(id, RecordUpdate::Pending, snapshot)?;
            }
            Some(RecordStatus::Failed) => ledger.reset(id, "retrying failed unit"),
            Some(_) => {}
        }
    }
    Ok(())
}

struct Execution {
    outcome: std::result::Result<Artifacts, ToolFailure>,
    /// Adapter thread still running after its deadline.
    abandoned: Option<JoinHandle<()>>,
}

/// Run the adapter for one unit, enforcing the configured per-unit timeout.
///
/// With a timeout the adapter runs on its own thread; if it has not answered
/// by the deadline the unit fails and the thread is handed back to the
/// caller, which must not start another unit before it exits.
fn execute_unit(
    adapter: Arc<dyn ToolAdapter>,
    entry: RegistryEntry,
    config: Arc<StageConfig>,
) -> Execution {
    let limit = match config.system.unit_timeout() {
        Some(limit) => limit,
        None => {
            return Execution {
                outcome: guarded(adapter.as_ref(), &entry, &config, &ExecContext::default()),
                abandoned: None,
            }
        }
    };
    let ctx = ExecContext::with_timeout(Some(limit));
    let unit = entry.id().clone();
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name(format!("tomoflow-watchdog-{unit}"))
        .spawn(move || {
            let _ = tx.send(guarded(adapter.as_ref(), &entry, &config, &ctx));
        });
    let handle = match spawned {
        Ok(handle) => handle,
        Err(e) => {
            return Execution {
                outcome: Err(ToolFailure::launch(format!("cannot start unit thread: {e}"))),
                abandoned: None,
            }
        }
    };

    match rx.recv_timeout(limit) {
        Ok(outcome) => Execution {
            outcome,
            abandoned: None,
        },
        Err(RecvTimeoutError::Timeout) => {
            warn!(unit = %unit, timeout_secs = limit.as_secs(), "Unit timed out");
            Execution {
                outcome: Err(ToolFailure::timeout(limit)),
                abandoned: Some(handle),
            }
        }
        Err(RecvTimeoutError::Disconnected) => Execution {
            outcome: Err(ToolFailure::new(
                FailureKind::Panicked,
                "adapter thread exited without a result",
            )),
            abandoned: None,
        },
    }
}

fn guarded(
    adapter: &dyn ToolAdapter,
    entry: &RegistryEntry,
    config: &StageConfig,
    ctx: &ExecContext,
) -> std::result::Result<Artifacts, ToolFailure> {
    catch_unwind(AssertUnwindSafe(|| adapter.execute(entry, config, ctx))).unwrap_or_else(
        |payload| {
            Err(ToolFailure::new(
                FailureKind::Panicked,
                format!("{} panicked: {}", adapter.name(), panic_message(payload.as_ref())),
            ))
        },
    )
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Options of one stage invocation.
#[derive(Clone, Default)]
pub struct StageOptions {
    /// Includes an explicit process list, if any.
    pub overrides: Overrides,
    /// Reset the records of the candidate units, completed ones included.
    pub force: bool,
    pub cancel: CancelToken,
    pub reporter: Option<Arc<dyn ProgressReporter>>,
}

/// Ledgers of every stage before `stage`, oldest first.
pub fn ancestor_ledgers(project: &Project, stage: Stage) -> Result<Vec<StageLedger>> {
    stage
        .lineage()
        .into_iter()
        .filter(|s| *s != stage)
        .map(|s| StageLedger::load(&project.ledger_path(s), s))
        .collect()
}

/// Full invocation of one stage: restrict the registry, resolve the config,
/// open the ledger, build the process list and run it.
///
/// Configuration and process-list errors are returned before the ledger is
/// written.
pub fn run_stage(
    project: &Project,
    stage: Stage,
    adapter: Arc<dyn ToolAdapter>,
    options: &StageOptions,
) -> Result<RunReport> {
    let master = MasterConfig::load(&project.master_config_path())?;
    let units = MasterRegistry::load(&project.registry_path())?.units;
    let ancestors = ancestor_ledgers(project, stage)?;
    let registry = UnitRegistry::for_stage(stage, &units, &ancestors)?;

    let config = ParameterStore::new(project, &master).resolve(stage, &options.overrides)?;

    let ledger_path = project.ledger_path(stage);
    let mut ledger = StageLedger::open(&ledger_path, stage, &config.snapshot()?)?;

    if options.force {
        let explicit = &config.system.process_list;
        for id in registry.ids() {
            if explicit.is_empty() || explicit.contains(id) {
                ledger.reset(id, "forced rerun");
            }
        }
    }
    let list = process_list::build(&registry, &ledger, &config.system.process_list)?;

    let mut runner = StageRunner::new(config, adapter).with_cancel(options.cancel.clone());
    if let Some(reporter) = &options.reporter {
        runner = runner.with_reporter(Arc::clone(reporter));
    }
    runner.run(&registry, &list, &mut ledger, &ledger_path)
}
