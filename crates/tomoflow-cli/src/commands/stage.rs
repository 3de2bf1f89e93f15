use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tomoflow_core::params::ParameterStore;
use tomoflow_core::pipeline::{run_stage, StageOptions};
use tomoflow_core::registry::UnitId;
use tomoflow_core::stage::Stage;
use tomoflow_core::tools::adapter_for;
use tracing::{info, warn};

use super::{cancel_on_interrupt, load_master, OverrideArgs, ProjectArgs};
use crate::progress::BarReporter;
use crate::summary;

#[derive(Args)]
pub struct StageArgs {
    #[command(subcommand)]
    pub action: StageAction,
}

impl StageArgs {
    pub fn project(&self) -> &ProjectArgs {
        match &self.action {
            StageAction::NewConfig(args) => &args.project,
            StageAction::Run(args) => &args.project,
        }
    }
}

#[derive(Subcommand)]
pub enum StageAction {
    /// Write a fresh stage config from the master config and the upstream stage
    NewConfig(NewConfigArgs),
    /// Process every eligible unit that is not completed yet
    Run(StageRunArgs),
}

#[derive(Args)]
pub struct NewConfigArgs {
    #[command(flatten)]
    pub project: ProjectArgs,

    #[command(flatten)]
    pub overrides: OverrideArgs,
}

#[derive(Args)]
pub struct StageRunArgs {
    #[command(flatten)]
    pub project: ProjectArgs,

    #[command(flatten)]
    pub overrides: OverrideArgs,

    /// Comma-separated units to consider for this run only
    #[arg(long, value_delimiter = ',')]
    pub process_list: Vec<String>,

    /// Reprocess the selected units even if they are completed
    #[arg(long)]
    pub force: bool,
}

pub fn run(stage: Stage, args: &StageArgs) -> Result<ExitCode> {
    match &args.action {
        StageAction::NewConfig(a) => new_config(stage, a),
        StageAction::Run(a) => run_units(stage, a),
    }
}

fn new_config(stage: Stage, args: &NewConfigArgs) -> Result<ExitCode> {
    let project = args.project.open()?;
    let master = load_master(&project)?;
    let overrides = args.overrides.parse()?;
    ParameterStore::new(&project, &master)
        .new_config(stage, &overrides)
        .with_context(|| format!("Cannot configure {stage}"))?;
    println!(
        "{stage} config written to {}",
        project.stage_config_path(stage).display()
    );
    Ok(ExitCode::SUCCESS)
}

fn run_units(stage: Stage, args: &StageRunArgs) -> Result<ExitCode> {
    let project = args.project.open()?;
    let mut overrides = args.overrides.parse()?;
    if !args.process_list.is_empty() {
        let units = args
            .process_list
            .iter()
            .map(|u| UnitId::new(u.trim()))
            .collect();
        overrides = overrides.with_process_list(units);
    }
    let options = StageOptions {
        overrides,
        force: args.force,
        cancel: cancel_on_interrupt()?,
        reporter: Some(Arc::new(BarReporter::new())),
    };
    info!(stage = stage.key(), project = project.name(), "Stage invoked");

    let report = run_stage(&project, stage, adapter_for(stage), &options)
        .with_context(|| format!("{stage} run failed"))?;
    summary::print_stage_report(&report);
    if report.cancelled {
        warn!(
            stage = stage.key(),
            not_started = report.not_started.len(),
            "Run interrupted, rerun to process the remaining units"
        );
    }

    Ok(if report.failed.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
