//! Command-line entry point.
//!
//! Thin wrapper over the library: loads and validates the configuration,
//! reads the manifest, plans the DAG, and executes or dry-runs it. Exit
//! codes: 0 success, 1 fatal, 2 soft warning (`--strict` promotes warnings
//! and skips to failures).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use spineprep::prelude::*;

#[derive(Parser)]
#[command(name = "spineprep", version, about = "Spinal-cord fMRI preprocessing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan and execute the preprocessing graph.
    Run {
        /// Input dataset root.
        #[arg(long)]
        bids_dir: PathBuf,
        /// Output derivatives root.
        #[arg(long)]
        out_dir: PathBuf,
        /// Configuration file (TOML or JSON).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Manifest TSV produced by dataset discovery.
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Plan only; execute nothing.
        #[arg(long)]
        dry_run: bool,
        /// Export the DAG (`.svg` renders via dot when available).
        #[arg(long)]
        save_dag: Option<PathBuf>,
        /// Echo the effective configuration before running.
        #[arg(long)]
        print_config: bool,
        /// Promote skips and warnings to failures.
        #[arg(long)]
        strict: bool,
        /// Worker pool size for step execution.
        #[arg(long, default_value_t = 1)]
        cores: usize,
    },
    /// Report external tool availability.
    Doctor,
}

fn main() -> ExitCode {
    init_tracing();
    match Cli::parse().command {
        Command::Run {
            bids_dir,
            out_dir,
            config,
            manifest,
            dry_run,
            save_dag,
            print_config,
            strict,
            cores,
        } => match run(
            bids_dir,
            out_dir,
            config,
            manifest,
            dry_run,
            save_dag,
            print_config,
            strict,
            cores,
        ) {
            Ok(code) => ExitCode::from(code),
            Err(e) => {
                error!(error = %e, "fatal");
                eprintln!("error: {e}");
                ExitCode::from(1)
            }
        },
        Command::Doctor => {
            let report = DoctorReport::probe();
            println!("{}", report.to_json());
            ExitCode::SUCCESS
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    bids_dir: PathBuf,
    out_dir: PathBuf,
    config_path: Option<PathBuf>,
    manifest_path: Option<PathBuf>,
    dry_run: bool,
    save_dag: Option<PathBuf>,
    print_config: bool,
    strict: bool,
    cores: usize,
) -> Result<u8> {
    let mut config = match &config_path {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => SpineConfig::default(),
    };
    // Command-line paths win over the configuration file.
    config.paths.bids_dir = bids_dir;
    config.paths.deriv_dir = out_dir;
    config.validate()?;

    if print_config {
        println!("{}", ConfigLoader::to_json_string(&config)?);
    }

    let manifest_path = manifest_path
        .unwrap_or_else(|| config.paths.deriv_dir.join("logs").join("manifest.tsv"));
    let mut manifest = Manifest::from_tsv(&manifest_path)?;
    manifest.verify_readable()?;
    manifest.assign_motion_groups(
        &config.options.motion.group_mode,
        &config.options.motion.require_same,
    )?;

    let dag = Dag::plan(&manifest, &config)?;

    let mut soft_warnings = Vec::new();
    if let Some(dag_path) = &save_dag {
        let svg_fallback = dag.export(dag_path)?;
        if svg_fallback {
            soft_warnings.push(format!(
                "graph renderer 'dot' not found; wrote DOT text to {}",
                dag_path.display()
            ));
        }
        info!(path = %dag_path.display(), "DAG exported");
    }

    let executor = Executor::new(&config, &manifest);
    let mode = if dry_run { ExecMode::DryRun } else { ExecMode::Run };
    let mut summary = executor.execute(&dag, mode, cores)?;
    summary.soft_warnings.extend(soft_warnings);

    if !dry_run {
        spineprep::qc::collect_and_write(&manifest, executor.layout())?;
    }

    print!("{summary}");
    Ok(summary.exit_code(strict) as u8)
}
