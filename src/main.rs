// src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use debsync::progress::{CliReporter, LogReporter, ProgressReporter};
use debsync::{version, Config, Mirror, Scheduler};
use std::cmp::Ordering;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "debsync")]
#[command(author, version, about = "Mirror a dependency-closed subset of Debian archives", long_about = None)]
struct Cli {
    /// Log progress instead of drawing progress bars
    #[arg(long, global = true)]
    no_progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load all sources, write the essential set and download the minimal
    /// package set
    Sync {
        /// Path to the YAML configuration
        config: PathBuf,
    },
    /// Resolve packages for one architecture and print the `.deb` files
    Select {
        /// Path to the YAML configuration
        config: PathBuf,
        /// Target architecture
        #[arg(short, long)]
        arch: String,
        /// Packages to resolve
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Compare two Debian versions and print <, = or >
    CompareVersions { a: String, b: String },
}

fn reporter(no_progress: bool) -> Arc<dyn ProgressReporter> {
    if no_progress || !std::io::stderr().is_terminal() {
        Arc::new(LogReporter)
    } else {
        Arc::new(CliReporter::new())
    }
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("Failed to load config {}", path.display()))
}

fn run_sync(config: Config, progress: Arc<dyn ProgressReporter>) -> Result<bool> {
    let scheduler = Scheduler::new();
    let result = Mirror::new(config, &scheduler, progress)
        .and_then(|mirror| mirror.run())
        .context("Sync failed");
    // Drain every queue and detached job before leaving
    scheduler.join();

    let report = result?;
    for (name, e) in &report.download.failed {
        error!("{}: {}", name, e);
    }
    if !report.is_complete() {
        error!(
            "{} of {} packages could not be downloaded",
            report.download.failed.len(),
            report.download.files.len()
        );
        return Ok(false);
    }
    info!("Mirror complete: {} packages", report.download.files.len());
    Ok(true)
}

fn run_select(
    config: Config,
    arch: &str,
    packages: &[String],
    progress: Arc<dyn ProgressReporter>,
) -> Result<()> {
    let scheduler = Scheduler::new();
    let result = Mirror::new(config, &scheduler, progress).and_then(|mirror| {
        mirror.load_sources()?;
        mirror.resolve(arch, packages)
    });
    scheduler.join();

    for file in result.context("Selection failed")? {
        println!("{}", file);
    }
    Ok(())
}

fn main() -> Result<ExitCode> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sync { config } => {
            let config = load_config(&config)?;
            let complete = run_sync(config, reporter(cli.no_progress))?;
            Ok(if complete {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Select {
            config,
            arch,
            packages,
        } => {
            let config = load_config(&config)?;
            run_select(config, &arch, &packages, reporter(cli.no_progress))?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::CompareVersions { a, b } => {
            let ordering = version::compare(&a, &b)
                .with_context(|| format!("Cannot compare {:?} and {:?}", a, b))?;
            println!(
                "{}",
                match ordering {
                    Ordering::Less => "<",
                    Ordering::Equal => "=",
                    Ordering::Greater => ">",
                }
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}
