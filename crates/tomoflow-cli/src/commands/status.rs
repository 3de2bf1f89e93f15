use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use tomoflow_core::ledger::StageLedger;
use tomoflow_core::registry::MasterRegistry;
use tomoflow_core::stage::Stage;

use super::ProjectArgs;
use crate::summary;

#[derive(Args)]
pub struct StatusArgs {
    #[command(flatten)]
    pub project: ProjectArgs,

    /// List the failed units of every stage with their errors
    #[arg(long)]
    pub failed: bool,
}

pub fn run(args: &StatusArgs) -> Result<ExitCode> {
    let project = args.project.open()?;
    let registered = MasterRegistry::load(&project.registry_path())?.units.len();
    let ledgers = Stage::ALL
        .into_iter()
        .map(|stage| StageLedger::load(&project.ledger_path(stage), stage))
        .collect::<Result<Vec<_>, _>>()?;

    summary::print_status(project.name(), registered, &ledgers, args.failed);
    Ok(ExitCode::SUCCESS)
}
