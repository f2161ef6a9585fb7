//! axle image builder CLI
//!
//! # Usage
//!
//! ```bash
//! # Build everything that changed, then boot the image in qemu
//! axle-build
//!
//! # Build only
//! axle-build --no_run
//!
//! # Boot the existing image, halted until gdb attaches on :1234
//! axle-build --run_only --debug
//!
//! # Wipe and rebuild two Meson programs
//! axle-build --force_rebuild_programs awm libgui
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use axle_builder::build::context::BuildContext;
use axle_builder::config::{BuildConfig, CONFIG_FILENAME};
use axle_builder::pipeline::{Pipeline, PipelineOptions, RunMode};

#[derive(Parser)]
#[command(name = "axle-build")]
#[command(author, version, about = "Build and boot the axle OS image", long_about = None)]
struct Cli {
    /// Wipe and rebuild these Meson programs, ignoring recency
    #[arg(long = "force_rebuild_programs", num_args = 1.., value_name = "PROGRAM")]
    force_rebuild_programs: Vec<String>,

    /// Wipe and rebuild every Meson program
    #[arg(long = "force_rebuild_everything")]
    force_rebuild_everything: bool,

    /// Build without booting the image
    #[arg(long = "no_run", conflicts_with = "run_only")]
    no_run: bool,

    /// Boot the existing image without building
    #[arg(long = "run_only")]
    run_only: bool,

    /// Start qemu's gdb stub and halt at entry
    #[arg(long)]
    debug: bool,

    /// Configuration file (default: <repo-root>/axle-build.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Repository root (default: nearest ancestor with axle-build.toml, else
    /// the current directory)
    #[arg(long = "repo-root")]
    repo_root: Option<PathBuf>,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn mode(&self) -> RunMode {
        if self.run_only {
            RunMode::RunOnly
        } else if self.no_run {
            RunMode::BuildOnly
        } else {
            RunMode::Full
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: a tracing subscriber was already installed");
    }
}

fn run(cli: Cli) -> Result<()> {
    let repo_root = match &cli.repo_root {
        Some(root) => root.clone(),
        None => find_repo_root(&std::env::current_dir().context("Failed to read current directory")?),
    };
    let repo_root = repo_root
        .canonicalize()
        .with_context(|| format!("Repository root {} does not exist", repo_root.display()))?;
    let config = BuildConfig::load(&repo_root, cli.config.as_deref())?;

    let options = PipelineOptions {
        mode: cli.mode(),
        force_rebuild_programs: cli.force_rebuild_programs,
        force_rebuild_everything: cli.force_rebuild_everything,
        debug: cli.debug,
    };
    Pipeline::new(BuildContext::new(repo_root, config), options)?.run()
}

fn find_repo_root(start: &Path) -> PathBuf {
    start
        .ancestors()
        .find(|dir| dir.join(CONFIG_FILENAME).is_file())
        .unwrap_or(start)
        .to_path_buf()
}
