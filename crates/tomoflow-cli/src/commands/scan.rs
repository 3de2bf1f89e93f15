use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Args;
use tomoflow_core::registry::{scan_source, MasterRegistry};

use super::{load_master, ProjectArgs};

#[derive(Args)]
pub struct ScanArgs {
    #[command(flatten)]
    pub project: ProjectArgs,

    /// Replace an existing master registry
    #[arg(long)]
    pub force: bool,
}

pub fn run(args: &ScanArgs) -> Result<ExitCode> {
    let project = args.project.open()?;
    let master = load_master(&project)?;

    let units = scan_source(&master.source, project.root()).context("Raw data scan failed")?;
    let images: usize = units.iter().map(|u| u.raw_inputs.len()).sum();
    let registry = MasterRegistry { units };
    registry.save(&project.registry_path(), args.force)?;

    println!(
        "Found {} tilt-series ({} images); registry written to {}",
        registry.units.len(),
        images,
        project.registry_path().display()
    );
    Ok(ExitCode::SUCCESS)
}
