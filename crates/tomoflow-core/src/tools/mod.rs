//! Adapters around the external programs that do the actual processing.

pub mod command;
mod ctffind;
mod imod;
mod motioncorr;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::params::StageConfig;
use crate::registry::{Artifacts, RegistryEntry};
use crate::stage::Stage;

pub use command::{run_invocation, ToolInvocation};
pub use ctffind::CtffindAdapter;
pub use imod::{ImodAlignAdapter, ImodReconAdapter};
pub use motioncorr::MotionCorrAdapter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The program could not be started, or its inputs could not be prepared.
    Launch,
    ExitStatus,
    MissingOutput,
    Timeout,
    Panicked,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Launch => write!(f, "launch failed"),
            Self::ExitStatus => write!(f, "non-zero exit"),
            Self::MissingOutput => write!(f, "missing output"),
            Self::Timeout => write!(f, "timed out"),
            Self::Panicked => write!(f, "adapter panicked"),
        }
    }
}

/// Why one unit failed in one stage. Recorded in the ledger; never aborts a
/// stage.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ToolFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ToolFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn launch(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Launch, message)
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("no result within {}s", limit.as_secs_f64()),
        )
    }
}

/// Per-invocation execution context handed to adapters.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecContext {
    /// Point in time at which a still-running external process is killed.
    pub deadline: Option<Instant>,
}

impl ExecContext {
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Runs one external tool for one unit.
///
/// Implementations must be safe to call from several worker threads at once
/// for different units.
pub trait ToolAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Process `entry` and return the artifacts it produced.
    fn execute(
        &self,
        entry: &RegistryEntry,
        config: &StageConfig,
        ctx: &ExecContext,
    ) -> Result<Artifacts, ToolFailure>;
}

/// The production adapter for `stage`.
pub fn adapter_for(stage: Stage) -> Arc<dyn ToolAdapter> {
    match stage {
        Stage::MotionCorrection => Arc::new(MotionCorrAdapter),
        Stage::CtfEstimation => Arc::new(CtffindAdapter),
        Stage::Alignment => Arc::new(ImodAlignAdapter),
        Stage::Reconstruction => Arc::new(ImodReconAdapter),
    }
}

/// Fail with `Launch` when `config` carries another stage's parameters.
pub(crate) fn wrong_params(adapter: &str, config: &StageConfig) -> ToolFailure {
    ToolFailure::launch(format!(
        "{adapter} cannot run with {} parameters",
        config.params.stage()
    ))
}

/// Artifact role for the `n`th image of a series, e.g. `corrected_007`.
pub(crate) fn image_role(prefix: &str, index: u32) -> String {
    format!("{prefix}_{index:03}")
}
