#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use tomoflow_core::ledger::{LedgerCounts, StageLedger};
use tomoflow_core::params::{MasterConfig, StageConfig};
use tomoflow_core::pipeline::CancelToken;
use tomoflow_core::project::Project;
use tomoflow_core::registry::{scan_source, Artifacts, MasterRegistry, RegistryEntry, UnitId};
use tomoflow_core::stage::Stage;
use tomoflow_core::tools::{ExecContext, FailureKind, ToolAdapter, ToolFailure};

/// Tilt angles written for every synthetic tilt-series.
pub const ANGLES: [f64; 3] = [0.0, -3.0, 3.0];

/// A project in a temporary directory with raw images for `units` and a
/// master registry already written.
pub struct TestProject {
    pub dir: TempDir,
    pub project: Project,
    pub master: MasterConfig,
}

impl TestProject {
    pub fn new(units: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        fs::create_dir_all(&raw).unwrap();
        for unit in units {
            write_tilt_series(&raw, "TS", unit);
        }

        let project = Project::new("TS", dir.path()).unwrap();
        let mut master = MasterConfig::new("TS");
        master.source.source_folder = raw;
        master.system.output_root = dir.path().to_path_buf();
        master.acquisition.pixel_size = Some(1.1);
        master.acquisition.voltage = Some(300.0);
        master.acquisition.rotation_angle = Some(85.0);
        master.save(&project.master_config_path()).unwrap();

        let scanned = scan_source(&master.source, project.root()).unwrap();
        MasterRegistry { units: scanned }
            .save(&project.registry_path(), false)
            .unwrap();

        Self {
            dir,
            project,
            master,
        }
    }

    pub fn ledger(&self, stage: Stage) -> StageLedger {
        StageLedger::load(&self.project.ledger_path(stage), stage).unwrap()
    }
}

/// Write `<prefix>_<unit>_<index>_<angle>.mrc` for every angle in [`ANGLES`].
pub fn write_tilt_series(dir: &std::path::Path, prefix: &str, unit: &str) {
    for (i, angle) in ANGLES.iter().enumerate() {
        let name = format!("{prefix}_{unit}_{:03}_{angle:.1}.mrc", i + 1);
        fs::write(dir.join(name), b"raw").unwrap();
    }
}

pub fn ids(names: &[&str]) -> Vec<UnitId> {
    names.iter().map(|n| UnitId::from(*n)).collect()
}

/// What the fake adapter does for one unit.
#[derive(Clone)]
pub enum Behaviour {
    Succeed,
    Fail,
    Panic,
    /// Sleep without watching the deadline, then succeed.
    Sleep(Duration),
    /// Block until the execution deadline passes, like a tool that gets
    /// killed at the deadline.
    Hang,
    /// Cancel the token, then succeed.
    CancelThenSucceed(CancelToken),
    /// Wait (up to two seconds) until the ledger on disk holds at least `n`
    /// completed records, record its counts, then succeed.
    ProbeLedger(PathBuf, usize),
}

/// Scripted stand-in for an external tool. Successful units get one output
/// file, `<output_path>/<unit>.<stage_key>`, under role `<stage_key>_out`.
pub struct FakeAdapter {
    stage: Stage,
    behaviours: HashMap<String, Behaviour>,
    pub calls: Mutex<Vec<UnitId>>,
    pub probes: Mutex<Vec<LedgerCounts>>,
    active: AtomicUsize,
    /// Most executions seen running at the same time.
    pub peak: AtomicUsize,
}

struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeAdapter {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            behaviours: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            probes: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, unit: &str, behaviour: Behaviour) -> Self {
        self.behaviours.insert(unit.to_string(), behaviour);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> Vec<UnitId> {
        let mut calls = self.calls.lock().unwrap().clone();
        calls.sort();
        calls
    }

    pub fn role(stage: Stage) -> String {
        format!("{}_out", stage.key())
    }

    fn write_output(
        &self,
        entry: &RegistryEntry,
        config: &StageConfig,
    ) -> Result<Artifacts, ToolFailure> {
        let dir = &config.system.output_path;
        let path = dir.join(format!("{}.{}", entry.id(), self.stage.key()));
        fs::create_dir_all(dir)
            .and_then(|_| fs::write(&path, b"out"))
            .map_err(|e| ToolFailure::launch(e.to_string()))?;
        Ok(Artifacts::from([(Self::role(self.stage), path)]))
    }
}

impl ToolAdapter for FakeAdapter {
    fn name(&self) -> &str {
        "fake"
    }

    fn execute(
        &self,
        entry: &RegistryEntry,
        config: &StageConfig,
        ctx: &ExecContext,
    ) -> Result<Artifacts, ToolFailure> {
        self.calls.lock().unwrap().push(entry.id().clone());
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let _running = Running(&self.active);

        let behaviour = self
            .behaviours
            .get(entry.id().as_str())
            .cloned()
            .unwrap_or(Behaviour::Succeed);
        match behaviour {
            Behaviour::Succeed => {}
            Behaviour::Fail => {
                return Err(ToolFailure::new(FailureKind::ExitStatus, "exit code 1"));
            }
            Behaviour::Panic => panic!("fake tool crashed on {}", entry.id()),
            Behaviour::Sleep(d) => thread::sleep(d),
            Behaviour::Hang => {
                while !ctx.expired() {
                    thread::sleep(Duration::from_millis(10));
                }
                return Err(ToolFailure::new(FailureKind::Timeout, "killed at deadline"));
            }
            Behaviour::CancelThenSucceed(token) => token.cancel(),
            Behaviour::ProbeLedger(path, n) => {
                let deadline = Instant::now() + Duration::from_secs(2);
                let counts = loop {
                    let counts = StageLedger::load(&path, self.stage)
                        .map_err(|e| ToolFailure::launch(e.to_string()))?
                        .counts();
                    if counts.completed >= n || Instant::now() >= deadline {
                        break counts;
                    }
                    thread::sleep(Duration::from_millis(10));
                };
                self.probes.lock().unwrap().push(counts);
            }
        }
        self.write_output(entry, config)
    }
}
