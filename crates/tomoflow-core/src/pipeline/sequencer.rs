use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Result, TomoError};
use crate::project::Project;
use crate::stage::Stage;
use crate::tools::ToolAdapter;

use super::runner::{run_stage, RunReport, StageOptions};

/// What happened to one stage of a `run_all`.
#[derive(Clone, Debug, PartialEq)]
pub enum StageOutcome {
    Ran(RunReport),
    /// No eligible units: the predecessor completed none.
    Skipped { reason: String },
    /// Not attempted because an earlier stage failed totally.
    NotRun,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StageSummary {
    pub stage: Stage,
    pub outcome: StageOutcome,
}

/// Run `stages` in declared dependency order.
///
/// A stage without eligible units is skipped with a warning. A stage in
/// which every candidate fails stops the sequence; the remaining stages are
/// reported as [`StageOutcome::NotRun`]. Any other error aborts the call.
pub fn run_all<F>(
    project: &Project,
    stages: &[Stage],
    mut adapter_for: F,
    options: &StageOptions,
) -> Result<Vec<StageSummary>>
where
    F: FnMut(Stage) -> Arc<dyn ToolAdapter>,
{
    let mut ordered = stages.to_vec();
    ordered.sort();
    ordered.dedup();

    let mut summaries = Vec::with_capacity(ordered.len());
    let mut stopped = false;
    for stage in ordered {
        if stopped {
            summaries.push(StageSummary {
                stage,
                outcome: StageOutcome::NotRun,
            });
            continue;
        }
        if options.cancel.is_cancelled() {
            info!(stage = stage.key(), "Run cancelled before stage");
            stopped = true;
            summaries.push(StageSummary {
                stage,
                outcome: StageOutcome::NotRun,
            });
            continue;
        }

        let outcome = match run_stage(project, stage, adapter_for(stage), options) {
            Ok(report) => {
                if report.is_total_failure() {
                    warn!(
                        stage = stage.key(),
                        failed = report.failed.len(),
                        "Every unit failed, stopping the pipeline"
                    );
                    stopped = true;
                }
                StageOutcome::Ran(report)
            }
            Err(e @ TomoError::StageDependency { .. }) => {
                warn!(stage = stage.key(), "{e}; skipping stage");
                StageOutcome::Skipped {
                    reason: e.to_string(),
                }
            }
            Err(e) => return Err(e),
        };
        summaries.push(StageSummary { stage, outcome });
    }
    Ok(summaries)
}

/// Whether any unit of the last stage that actually ran ended failed.
pub fn final_stage_failed(summaries: &[StageSummary]) -> bool {
    summaries
        .iter()
        .rev()
        .find_map(|s| match &s.outcome {
            StageOutcome::Ran(report) => Some(!report.failed.is_empty()),
            _ => None,
        })
        .unwrap_or(false)
}
