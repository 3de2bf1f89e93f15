pub mod init;
pub mod run_all;
pub mod scan;
pub mod stage;
pub mod status;

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Args;
use tomoflow_core::params::{MasterConfig, Overrides};
use tomoflow_core::pipeline::CancelToken;
use tomoflow_core::project::Project;
use tracing::warn;

/// Project selection shared by every subcommand.
#[derive(Args)]
pub struct ProjectArgs {
    /// Project name; artifacts are named `<project>_*.toml`
    pub project: String,

    /// Directory holding the project artifacts
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,
}

impl ProjectArgs {
    pub fn open(&self) -> Result<Project> {
        Project::new(self.project.as_str(), self.dir.clone())
            .with_context(|| format!("Invalid project {:?}", self.project))
    }
}

/// `--set key=value` overrides, repeatable.
#[derive(Args)]
pub struct OverrideArgs {
    /// Override a config value, e.g. `system.parallelism=4` or `params.tolerance=0.4`
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,
}

impl OverrideArgs {
    pub fn parse(&self) -> Result<Overrides> {
        Overrides::parse(&self.set).context("Invalid --set override")
    }
}

/// A token cancelled by the first Ctrl-C: running units finish and are
/// recorded, nothing new is dispatched. A second Ctrl-C exits at once and
/// leaves the running units `in_progress`.
pub fn cancel_on_interrupt() -> Result<CancelToken> {
    let token = CancelToken::new();
    let handler = token.clone();
    ctrlc::set_handler(move || {
        if handler.is_cancelled() {
            warn!("Second interrupt, exiting without waiting for running units");
            process::exit(130);
        }
        warn!("Interrupt received, waiting for running units to finish");
        handler.cancel();
    })
    .context("Failed to install the interrupt handler")?;
    Ok(token)
}

pub fn load_master(project: &Project) -> Result<MasterConfig> {
    MasterConfig::load(&project.master_config_path())
        .with_context(|| format!("Failed to load master config of {}", project.name()))
}
