use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::registry::UnitId;
use crate::stage::Stage;
use crate::tools::ToolFailure;

/// Thread-safe progress reporting for stage runs.
///
/// Implementors can use this to drive progress bars, logging, or any other
/// UI feedback. All methods have default no-op implementations.
pub trait ProgressReporter: Send + Sync {
    /// A stage run has started. `total_units` is the size of its process list.
    fn begin_stage(&self, _stage: Stage, _total_units: usize) {}

    /// A unit finished, successfully or not. `units_done` counts finished
    /// units so far in this run.
    fn unit_finished(&self, _unit: &UnitId, _failure: Option<&ToolFailure>, _units_done: usize) {}

    /// The current stage run is finished.
    fn finish_stage(&self) {}
}

/// No-op progress reporter, the default for a runner.
pub struct NoOpReporter;
impl ProgressReporter for NoOpReporter {}

/// Cooperative cancellation flag shared between the caller and a runner.
///
/// Once cancelled, no further units are dispatched; units already running
/// finish normally.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
