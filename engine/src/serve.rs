//! Orchestration for `engine serve`.
//!
//! Startup order matters: the directory lock is taken before anything under
//! the data directory is read, recovery runs before new jobs are accepted, and
//! the lock is released only after every driver has stopped.

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::backoff::RetryScheduler;
use crate::core::state::JobState;
use crate::core::types::{JobId, TransferSpec};
use crate::io::config::{EngineConfig, load_effective_config};
use crate::io::job_store::JobStore;
use crate::io::lock::DirectoryLock;
use crate::io::transfer::{CommandTransfer, Transfer};
use crate::retention::run_retention_loop;
use crate::runner::{JobRunner, ResumeSummary, RunnerSettings};

/// Inputs for `engine serve`.
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    pub data_dir: PathBuf,
    /// TOML job files submitted after recovery.
    pub jobs: Vec<PathBuf>,
    /// Return once every job has settled instead of waiting for shutdown.
    pub exit_when_idle: bool,
}

/// Outcome of one `engine serve` session.
#[derive(Debug)]
pub struct ServeSummary {
    pub recovered: usize,
    pub requeued: usize,
    pub corrupt: usize,
    pub resumed: ResumeSummary,
    pub submitted: Vec<JobId>,
    /// Final state of every job this session touched.
    pub outcomes: Vec<(JobId, JobState)>,
}

impl ServeSummary {
    pub fn count(&self, state: JobState) -> usize {
        self.outcomes.iter().filter(|(_, s)| *s == state).count()
    }

    pub fn has_failures(&self) -> bool {
        self.count(JobState::Failed) > 0
    }
}

/// Parse a job file (a TOML [`TransferSpec`]).
pub fn load_job_file(path: &Path) -> Result<TransferSpec> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let spec: TransferSpec =
        toml::from_str(&contents).with_context(|| format!("parse job {}", path.display()))?;
    spec.validate()
        .with_context(|| format!("validate job {}", path.display()))?;
    Ok(spec)
}

/// Run the engine with the configured transfer tool until `shutdown`
/// resolves (or until idle, with `exit_when_idle`).
pub async fn serve(
    options: &ServeOptions,
    shutdown: impl Future<Output = ()>,
) -> Result<ServeSummary> {
    let lock = DirectoryLock::acquire(&options.data_dir)?;
    let cfg = load_effective_config(&options.data_dir)?;
    let transfer = Arc::new(CommandTransfer::new(&cfg.transfer.command)?);
    let scheduler = RetryScheduler::new(cfg.retry_policy());
    serve_locked(options, lock, &cfg, transfer, scheduler, shutdown).await
}

/// Everything after lock acquisition and config loading.
pub async fn serve_locked(
    options: &ServeOptions,
    mut lock: DirectoryLock,
    cfg: &EngineConfig,
    transfer: Arc<dyn Transfer>,
    scheduler: RetryScheduler,
    shutdown: impl Future<Output = ()>,
) -> Result<ServeSummary> {
    let specs = options
        .jobs
        .iter()
        .map(|path| load_job_file(path))
        .collect::<Result<Vec<_>>>()?;

    let (store, report) = JobStore::open(&options.data_dir)?;
    let store = Arc::new(store);
    let settings = RunnerSettings::from_config(options.data_dir.clone(), cfg);
    let runner = JobRunner::new(Arc::clone(&store), transfer, scheduler, settings);

    let resumed = runner.resume()?;
    let mut submitted = Vec::with_capacity(specs.len());
    for spec in specs {
        submitted.push(runner.submit(spec)?.id);
    }
    info!(
        resumed = resumed.started.len(),
        submitted = submitted.len(),
        concurrency = cfg.job_concurrency,
        "engine running"
    );

    let retention_stop = CancellationToken::new();
    let retention_task = cfg.job_retention().map(|retention| {
        tokio::spawn(run_retention_loop(
            Arc::clone(&store),
            retention,
            cfg.retention_sweep_interval(),
            retention_stop.clone(),
        ))
    });

    if options.exit_when_idle {
        tokio::select! {
            () = runner.wait_idle() => info!("all jobs settled"),
            () = shutdown => info!("shutdown requested"),
        }
    } else {
        shutdown.await;
        info!("shutdown requested");
    }

    runner.shutdown().await;
    retention_stop.cancel();
    if let Some(task) = retention_task
        && let Err(err) = task.await
    {
        warn!(err = %err, "retention task failed");
    }
    lock.release();

    let outcomes = submitted
        .iter()
        .chain(&resumed.started)
        .chain(&resumed.failed)
        .filter_map(|id| store.load(*id).map(|job| (job.id, job.state)))
        .collect();
    Ok(ServeSummary {
        recovered: report.loaded,
        requeued: report.requeued.len(),
        corrupt: report.corrupt.len(),
        resumed,
        submitted,
        outcomes,
    })
}
