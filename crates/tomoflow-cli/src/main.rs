mod commands;
mod progress;
mod summary;

use std::fs::{self, OpenOptions};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use commands::ProjectArgs;
use tomoflow_core::stage::Stage;

#[derive(Parser)]
#[command(name = "tomoflow", about = "Tilt-series preprocessing pipeline")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the master config of a new project
    Init(commands::init::InitArgs),
    /// Discover raw tilt-series and write the master registry
    Scan(commands::scan::ScanArgs),
    /// Motion correction (MotionCor2)
    Motioncorr(commands::stage::StageArgs),
    /// CTF estimation (CTFFind4)
    Ctffind(commands::stage::StageArgs),
    /// Stack creation and alignment (IMOD)
    Align(commands::stage::StageArgs),
    /// Tomogram reconstruction (IMOD)
    Recon(commands::stage::StageArgs),
    /// Run every stage in dependency order
    RunAll(commands::run_all::RunAllArgs),
    /// Show per-stage ledger counts
    Status(commands::status::StatusArgs),
}

impl Commands {
    fn project(&self) -> &ProjectArgs {
        match self {
            Self::Init(args) => &args.project,
            Self::Scan(args) => &args.project,
            Self::Motioncorr(args)
            | Self::Ctffind(args)
            | Self::Align(args)
            | Self::Recon(args) => args.project(),
            Self::RunAll(args) => &args.project,
            Self::Status(args) => &args.project,
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    match &cli.command {
        Commands::Init(args) => commands::init::run(args),
        Commands::Scan(args) => commands::scan::run(args),
        Commands::Motioncorr(args) => commands::stage::run(Stage::MotionCorrection, args),
        Commands::Ctffind(args) => commands::stage::run(Stage::CtfEstimation, args),
        Commands::Align(args) => commands::stage::run(Stage::Alignment, args),
        Commands::Recon(args) => commands::stage::run(Stage::Reconstruction, args),
        Commands::RunAll(args) => commands::run_all::run(args),
        Commands::Status(args) => commands::status::run(args),
    }
}

/// Console output filtered by `--verbose` or `RUST_LOG`, plus an
/// uncoloured `info`-level copy appended to the project log file.
fn init_logging(cli: &Cli) -> Result<()> {
    let console_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });

    let project = cli.command.project().open()?;
    fs::create_dir_all(project.root())
        .with_context(|| format!("Failed to create {}", project.root().display()))?;
    let log_path = project.log_path();
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;
    let file_level = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(log_file))
                .with_filter(file_level),
        )
        .init();
    Ok(())
}
