use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tomoflow_core::pipeline::{final_stage_failed, run_all, StageOptions};
use tomoflow_core::stage::Stage;
use tomoflow_core::tools::adapter_for;
use tracing::info;

use super::{cancel_on_interrupt, OverrideArgs, ProjectArgs};
use crate::progress::BarReporter;
use crate::summary;

#[derive(Args)]
pub struct RunAllArgs {
    #[command(flatten)]
    pub project: ProjectArgs,

    /// Overrides for every stage; `<stage_key>.<key>` targets a single stage
    #[command(flatten)]
    pub overrides: OverrideArgs,
}

/// Exits non-zero when a unit of the last stage that ran ended failed.
pub fn run(args: &RunAllArgs) -> Result<ExitCode> {
    let project = args.project.open()?;
    let options = StageOptions {
        overrides: args.overrides.parse()?,
        cancel: cancel_on_interrupt()?,
        reporter: Some(Arc::new(BarReporter::new())),
        ..Default::default()
    };
    info!(project = project.name(), "Pipeline invoked");

    let summaries =
        run_all(&project, &Stage::ALL, adapter_for, &options).context("Pipeline run failed")?;
    summary::print_pipeline_summary(&summaries);

    Ok(if final_stage_failed(&summaries) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
