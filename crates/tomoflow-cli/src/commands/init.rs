use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Args;
use tomoflow_core::params::MasterConfig;

use super::ProjectArgs;

#[derive(Args)]
pub struct InitArgs {
    #[command(flatten)]
    pub project: ProjectArgs,

    /// Folder holding the raw tilt images, relative to the project directory
    #[arg(long)]
    pub source: Option<PathBuf>,

    /// Subfolder prefix: empty for the source folder itself, `*` for any subfolder
    #[arg(long)]
    pub folder_prefix: Option<String>,

    /// Raw file-name prefix (defaults to the project name)
    #[arg(long)]
    pub file_prefix: Option<String>,

    /// Raw image extension
    #[arg(long)]
    pub extension: Option<String>,

    /// Raw pixel size in Angstroms
    #[arg(long)]
    pub pixel_size: Option<f64>,

    /// Beam voltage in keV
    #[arg(long)]
    pub voltage: Option<f64>,

    /// Spherical aberration in mm
    #[arg(long)]
    pub cs: Option<f64>,

    /// Tilt-axis rotation angle in degrees
    #[arg(long)]
    pub rotation_angle: Option<f64>,

    /// Directory the stage output folders are created in
    #[arg(long)]
    pub output_root: Option<PathBuf>,

    /// Default number of concurrent tool invocations
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Overwrite an existing master config
    #[arg(long)]
    pub force: bool,
}

pub fn run(args: &InitArgs) -> Result<ExitCode> {
    let project = args.project.open()?;
    let path = project.master_config_path();
    if path.exists() && !args.force {
        bail!(
            "{} already exists; pass --force to overwrite it",
            path.display()
        );
    }

    let mut master = MasterConfig::new(project.name());
    let source = &mut master.source;
    if let Some(folder) = &args.source {
        source.source_folder = folder.clone();
    }
    if let Some(prefix) = &args.folder_prefix {
        source.folder_prefix = prefix.clone();
    }
    if let Some(prefix) = &args.file_prefix {
        source.file_prefix = prefix.clone();
    }
    if let Some(ext) = &args.extension {
        source.extension = ext.trim_start_matches('.').to_string();
    }
    let acq = &mut master.acquisition;
    acq.pixel_size = args.pixel_size.or(acq.pixel_size);
    acq.voltage = args.voltage.or(acq.voltage);
    acq.spherical_aberration = args.cs.or(acq.spherical_aberration);
    acq.rotation_angle = args.rotation_angle.or(acq.rotation_angle);
    if let Some(root) = &args.output_root {
        master.system.output_root = root.clone();
    }
    if let Some(n) = args.parallelism {
        master.system.parallelism = n;
    }

    master
        .save(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Master config written to {}", path.display());
    Ok(ExitCode::SUCCESS)
}
