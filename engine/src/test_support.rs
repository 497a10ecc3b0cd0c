//! Test-only helpers: a scripted transfer and deterministic fixtures.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::backoff::{RetryPolicy, RetryScheduler};
use crate::core::types::{AttemptError, JobId, TransferOp, TransferSpec};
use crate::io::job_store::JobStore;
use crate::io::transfer::{AttemptOutput, AttemptRequest, Transfer};
use crate::runner::{JobRunner, RunnerSettings};

/// What one scripted attempt does.
#[derive(Debug, Clone)]
pub enum ScriptedAttempt {
    Succeed,
    Fail { error: AttemptError, stderr: String },
    /// Block until canceled.
    Hang,
    SucceedAfter(Duration),
}

/// A failed attempt with exit status 1 and the given stderr.
pub fn fail(stderr: &str) -> ScriptedAttempt {
    ScriptedAttempt::Fail {
        error: AttemptError::Exited { code: Some(1) },
        stderr: stderr.to_string(),
    }
}

/// One recorded call to [`ScriptedTransfer::run`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub job_id: JobId,
    pub attempt: u32,
    pub at: Instant,
}

/// [`Transfer`] that replays a script, then repeats a fallback.
#[derive(Debug)]
pub struct ScriptedTransfer {
    script: Mutex<VecDeque<ScriptedAttempt>>,
    fallback: ScriptedAttempt,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransfer {
    pub fn new(script: impl IntoIterator<Item = ScriptedAttempt>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback: ScriptedAttempt::Succeed,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every attempt behaves like `attempt`.
    pub fn always(attempt: ScriptedAttempt) -> Self {
        Self::new(Vec::<ScriptedAttempt>::new()).with_fallback(attempt)
    }

    pub fn with_fallback(mut self, fallback: ScriptedAttempt) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn calls_for(&self, job_id: JobId) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.job_id == job_id)
            .collect()
    }

    /// Highest number of attempts observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> ScriptedAttempt {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Transfer for ScriptedTransfer {
    async fn run(&self, request: &AttemptRequest, cancel: &CancellationToken) -> AttemptOutput {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall {
                job_id: request.job_id,
                attempt: request.attempt,
                at: Instant::now(),
            });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let output = match self.next_step() {
            ScriptedAttempt::Succeed => AttemptOutput::succeeded(),
            ScriptedAttempt::Fail { error, stderr } => AttemptOutput::failed(error, stderr),
            ScriptedAttempt::Hang => {
                cancel.cancelled().await;
                AttemptOutput::failed(AttemptError::Canceled, "")
            }
            ScriptedAttempt::SucceedAfter(delay) => {
                tokio::select! {
                    () = cancel.cancelled() => AttemptOutput::failed(AttemptError::Canceled, ""),
                    () = tokio::time::sleep(delay) => AttemptOutput::succeeded(),
                }
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        output
    }
}

/// A valid copy job named after `name`.
pub fn transfer_spec(name: &str) -> TransferSpec {
    TransferSpec {
        op: TransferOp::Copy,
        source: format!("s3:src/{name}"),
        destination: format!("gcs:dst/{name}"),
        flags: Vec::new(),
    }
}

/// Jitter draw that always lands on the midpoint, i.e. no jitter.
pub fn midpoint_draw() -> f64 {
    0.5
}

pub fn settings(data_dir: &Path, concurrency: usize) -> RunnerSettings {
    RunnerSettings {
        concurrency,
        attempt_timeout: Duration::from_secs(60),
        log_max_bytes: 64 * 1024,
        data_dir: data_dir.to_path_buf(),
        capture_unknown_errors: false,
    }
}

/// Runner over a fresh store in `data_dir` with default retry limits and no
/// jitter.
pub fn runner(
    data_dir: &Path,
    transfer: Arc<ScriptedTransfer>,
    concurrency: usize,
) -> anyhow::Result<JobRunner> {
    runner_with_policy(data_dir, transfer, concurrency, RetryPolicy::default())
}

pub fn runner_with_policy(
    data_dir: &Path,
    transfer: Arc<ScriptedTransfer>,
    concurrency: usize,
    policy: RetryPolicy,
) -> anyhow::Result<JobRunner> {
    runner_with_settings(transfer, policy, settings(data_dir, concurrency))
}

/// Runner over a fresh store in `settings.data_dir`.
pub fn runner_with_settings(
    transfer: Arc<ScriptedTransfer>,
    policy: RetryPolicy,
    settings: RunnerSettings,
) -> anyhow::Result<JobRunner> {
    let (store, _) = JobStore::open(&settings.data_dir)?;
    Ok(JobRunner::new(
        Arc::new(store),
        transfer,
        RetryScheduler::with_draw(policy, midpoint_draw),
        settings,
    ))
}

/// Fresh temporary data directory.
pub fn data_dir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("engine-test-")
        .tempdir()
        .unwrap_or_else(|err| panic!("create temp data dir: {err}"))
}
