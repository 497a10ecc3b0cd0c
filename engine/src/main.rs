//! Retrying transfer job engine CLI.
//!
//! `serve` owns a data directory (exclusive lock), recovers interrupted jobs
//! and runs them with retries. `status` and `lock-info` are read-only and can
//! run next to a serving engine.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engine::core::state::JobState;
use engine::exit_codes;
use engine::io::lock::{LockError, read_holder};
use engine::serve::{ServeOptions, serve};
use engine::status::{collect_status, render_json, render_table};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "engine",
    version,
    about = "Runs object-storage transfer jobs with classified retries and crash recovery"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Lock the data directory, recover interrupted jobs and run jobs.
    Serve {
        #[arg(long)]
        data_dir: PathBuf,
        /// TOML job file to submit after recovery (repeatable).
        #[arg(long = "job")]
        jobs: Vec<PathBuf>,
        /// Exit once every job has settled.
        #[arg(long)]
        exit_when_idle: bool,
    },
    /// Print job status without taking the lock.
    Status {
        #[arg(long)]
        data_dir: PathBuf,
        /// Emit JSON status reports.
        #[arg(long)]
        json: bool,
        /// Include finished jobs.
        #[arg(long)]
        all: bool,
    },
    /// Print the lock holder diagnostics.
    LockInfo {
        #[arg(long)]
        data_dir: PathBuf,
    },
}

fn main() {
    engine::logging::init("engine=info");
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<LockError>() {
        Some(LockError::AlreadyLocked { .. }) => exit_codes::LOCKED,
        _ => exit_codes::INVALID,
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            data_dir,
            jobs,
            exit_when_idle,
        } => cmd_serve(ServeOptions {
            data_dir,
            jobs,
            exit_when_idle,
        }),
        Command::Status {
            data_dir,
            json,
            all,
        } => cmd_status(&data_dir, json, all),
        Command::LockInfo { data_dir } => cmd_lock_info(&data_dir),
    }
}

fn cmd_serve(options: ServeOptions) -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    let summary = runtime.block_on(serve(&options, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(err = %err, "cannot listen for ctrl-c; waiting forever");
            std::future::pending::<()>().await;
        }
    }))?;

    info!(
        recovered = summary.recovered,
        requeued = summary.requeued,
        corrupt = summary.corrupt,
        submitted = summary.submitted.len(),
        failed = summary.count(JobState::Failed),
        "engine stopped"
    );
    if options.exit_when_idle && summary.has_failures() {
        return Ok(exit_codes::JOBS_FAILED);
    }
    Ok(exit_codes::OK)
}

fn cmd_status(data_dir: &Path, json: bool, all: bool) -> Result<i32> {
    let reports = collect_status(data_dir, all)?;
    if json {
        print!("{}", render_json(&reports)?);
    } else {
        print!("{}", render_table(&reports));
    }
    Ok(exit_codes::OK)
}

fn cmd_lock_info(data_dir: &Path) -> Result<i32> {
    match read_holder(data_dir)? {
        Some(holder) => {
            let pid = holder
                .pid
                .map_or_else(|| "unknown".to_string(), |pid| pid.to_string());
            let started = holder
                .started_at
                .map_or_else(|| "unknown".to_string(), |ts| ts.to_rfc3339());
            println!("pid={pid}\nstarted_at={started}");
        }
        None => println!("no lock file"),
    }
    Ok(exit_codes::OK)
}
