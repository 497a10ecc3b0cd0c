//! Job runner: drives jobs through attempts, retries and cancellation.
//!
//! Every live job has exactly one driver task, so attempts of a job never
//! overlap. A driver acquires a worker slot before moving its job to
//! `running`, records the attempt outcome in the store, and only then gives
//! the slot back. While waiting for a retry the job holds no slot.
//!
//! Cancellation is store-first: [`JobRunner::cancel`] moves the job to
//! `canceled` and then fires the driver's token. Drivers never overwrite a
//! state they did not expect, so a transfer that finishes in the same instant
//! cannot resurrect a canceled job.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::backoff::RetryScheduler;
use crate::core::classifier::{Classification, ErrorCode, classify};
use crate::core::retry_hint::parse_retry_after;
use crate::core::state::JobState;
use crate::core::types::{AttemptError, Job, JobId, StatusReport, TransferSpec};
use crate::io::config::EngineConfig;
use crate::io::job_log::JobLog;
use crate::io::job_store::{JobStore, TransitionError};
use crate::io::transfer::{AttemptRequest, Transfer};
use crate::io::unknown_capture;

/// Runtime knobs for [`JobRunner`].
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Worker slots, i.e. jobs allowed in `running` at once.
    pub concurrency: usize,
    pub attempt_timeout: Duration,
    /// Job log ceiling in bytes, `0` for none.
    pub log_max_bytes: u64,
    pub data_dir: PathBuf,
    pub capture_unknown_errors: bool,
}

impl RunnerSettings {
    pub fn from_config(data_dir: PathBuf, cfg: &EngineConfig) -> Self {
        Self {
            concurrency: cfg.job_concurrency,
            attempt_timeout: cfg.attempt_timeout(),
            log_max_bytes: cfg.job_log_max_bytes,
            data_dir,
            capture_unknown_errors: cfg.capture_unknown_errors,
        }
    }
}

/// What [`JobRunner::resume`] did with recovered jobs.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ResumeSummary {
    pub started: Vec<JobId>,
    /// Jobs interrupted during their final allowed attempt.
    pub failed: Vec<JobId>,
}

/// Cloneable handle to the job runner.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<JobStore>,
    transfer: Arc<dyn Transfer>,
    scheduler: RetryScheduler,
    slots: Arc<Semaphore>,
    settings: RunnerSettings,
    /// Cancellation token per live driver.
    drivers: Mutex<HashMap<JobId, CancellationToken>>,
    idle: Notify,
    shutdown: CancellationToken,
}

impl JobRunner {
    pub fn new(
        store: Arc<JobStore>,
        transfer: Arc<dyn Transfer>,
        scheduler: RetryScheduler,
        settings: RunnerSettings,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        Self {
            inner: Arc::new(Inner {
                store,
                transfer,
                scheduler,
                slots,
                settings,
                drivers: Mutex::new(HashMap::new()),
                idle: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.inner.store
    }

    /// Persist a new job and start driving it.
    pub fn submit(&self, spec: TransferSpec) -> Result<Job> {
        let job = self.inner.store.create(spec)?;
        info!(job_id = %job.id, transfer = %job.spec.label(), "job submitted");
        self.spawn_driver(job.id, JobState::Pending);
        Ok(job)
    }

    /// Start drivers for `pending` jobs found at startup.
    ///
    /// A job that was interrupted during its final allowed attempt is failed
    /// instead of being run again.
    pub fn resume(&self) -> Result<ResumeSummary> {
        let max_attempts = self.inner.scheduler.policy().max_attempts;
        let mut summary = ResumeSummary::default();

        for job in self.inner.store.list_active() {
            if job.state != JobState::Pending {
                warn!(job_id = %job.id, state = %job.state, "skipping non-pending job on resume");
                continue;
            }
            if job.attempt_count >= max_attempts {
                let last_error = job.last_error.clone().unwrap_or_else(|| {
                    Classification::new(ErrorCode::Unknown, "interrupted after final attempt")
                });
                let code = last_error.code;
                match self.inner.store.compare_and_transition(
                    job.id,
                    JobState::Pending,
                    JobState::Failed,
                    |j| j.last_error = Some(last_error),
                ) {
                    Ok(_) => {
                        info!(
                            job_id = %job.id,
                            attempt_count = job.attempt_count,
                            code = %code,
                            "failing job interrupted on its final attempt"
                        );
                        summary.failed.push(job.id);
                    }
                    Err(err) => warn!(job_id = %job.id, err = %err, "could not fail exhausted job"),
                }
                continue;
            }
            if self.spawn_driver(job.id, JobState::Pending) {
                summary.started.push(job.id);
            }
        }
        Ok(summary)
    }

    /// Cancel a job. Returns `false` when the job is unknown or already
    /// terminal.
    pub fn cancel(&self, id: JobId) -> Result<bool> {
        loop {
            let Some(job) = self.inner.store.load(id) else {
                return Ok(false);
            };
            if job.state.is_terminal() {
                return Ok(false);
            }
            let reason = Classification::new(ErrorCode::Canceled, "canceled by request");
            match self.inner.store.compare_and_transition(
                id,
                job.state,
                JobState::Canceled,
                |j| j.last_error = Some(reason),
            ) {
                Ok(job) => {
                    info!(job_id = %id, "job canceled");
                    self.inner.append_log(&job, "info", "job canceled");
                    break;
                }
                // The driver moved the job in the meantime; look again.
                Err(TransitionError::StateMismatch { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }

        if let Some(token) = self.inner.drivers().get(&id) {
            token.cancel();
        }
        Ok(true)
    }

    pub fn status(&self, id: JobId) -> Option<StatusReport> {
        self.inner.store.status(id)
    }

    /// Number of jobs with a live driver.
    pub fn active_drivers(&self) -> usize {
        self.inner.drivers().len()
    }

    /// Resolve once no job has a live driver.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.drivers().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Stop every driver without touching job states. Interrupted jobs are
    /// recovered on the next start.
    pub async fn shutdown(&self) {
        info!(active = self.active_drivers(), "stopping job drivers");
        self.inner.shutdown.cancel();
        self.wait_idle().await;
    }

    fn spawn_driver(&self, id: JobId, from: JobState) -> bool {
        let token = {
            let mut drivers = self.inner.drivers();
            if drivers.contains_key(&id) {
                return false;
            }
            let token = self.inner.shutdown.child_token();
            drivers.insert(id, token.clone());
            token
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.drive(id, from, &token).await;
            let mut drivers = inner.drivers();
            drivers.remove(&id);
            if drivers.is_empty() {
                inner.idle.notify_waiters();
            }
        });
        true
    }
}

impl Inner {
    fn drivers(&self) -> MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.drivers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_log(&self, job: &Job) -> Option<Arc<JobLog>> {
        match JobLog::open(&job.log_path, self.settings.log_max_bytes) {
            Ok(log) => Some(Arc::new(log)),
            Err(err) => {
                warn!(job_id = %job.id, err = %format!("{err:#}"), "cannot open job log");
                None
            }
        }
    }

    fn append_log(&self, job: &Job, level: &str, line: &str) {
        if let Some(log) = self.open_log(job) {
            write_log(Some(&log), level, line);
        }
    }

    /// Run attempts for one job until it reaches a terminal state, is
    /// canceled, or the runner shuts down.
    async fn drive(&self, id: JobId, mut from: JobState, cancel: &CancellationToken) {
        let max_attempts = self.scheduler.policy().max_attempts;
        let mut log: Option<Arc<JobLog>> = None;

        loop {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let job = match self.store.compare_and_transition(id, from, JobState::Running, |j| {
                j.attempt_count += 1;
            }) {
                Ok(job) => job,
                Err(TransitionError::StateMismatch { actual, .. }) => {
                    debug!(job_id = %id, state = %actual, "job moved before its attempt started");
                    return;
                }
                Err(err) => {
                    error!(job_id = %id, err = %err, "cannot start attempt");
                    return;
                }
            };

            let attempt = job.attempt_count;
            if log.is_none() {
                log = self.open_log(&job);
            }
            write_log(
                log.as_ref(),
                "info",
                &format!("attempt {attempt}/{max_attempts}: {}", job.spec.label()),
            );
            info!(job_id = %id, attempt, "attempt started");

            let request = AttemptRequest {
                job_id: id,
                attempt,
                spec: job.spec.clone(),
                timeout: self.settings.attempt_timeout,
                log: log.clone(),
            };
            let output = self.transfer.run(&request, cancel).await;

            let err = match output.result {
                Ok(()) => {
                    self.finish(id, JobState::Succeeded, None, log.as_ref());
                    return;
                }
                Err(err) => err,
            };
            if err == AttemptError::Canceled || cancel.is_cancelled() {
                debug!(job_id = %id, attempt, "attempt stopped by cancellation");
                return;
            }

            let classification = classify(&err, &output.stderr_tail);
            if classification.code == ErrorCode::Unknown && self.settings.capture_unknown_errors {
                unknown_capture::maybe_capture(
                    &self.settings.data_dir,
                    id,
                    job.spec.op.as_str(),
                    &output.stderr_tail,
                    Utc::now(),
                );
            }
            let hint = parse_retry_after(&output.stderr_tail);
            let decision = self.scheduler.next_delay(attempt, &classification, hint);

            if !decision.should_retry {
                warn!(
                    job_id = %id,
                    attempt,
                    code = %classification.code,
                    "attempt failed, giving up"
                );
                self.finish(id, JobState::Failed, Some(classification), log.as_ref());
                return;
            }

            let code = classification.code;
            if let Err(err) = self.store.compare_and_transition(
                id,
                JobState::Running,
                JobState::RetryWaiting,
                |j| j.last_error = Some(classification),
            ) {
                debug!(job_id = %id, err = %err, "job moved before retry was scheduled");
                return;
            }
            drop(permit);

            warn!(
                job_id = %id,
                attempt,
                code = %code,
                delay_ms = u64::try_from(decision.delay.as_millis()).unwrap_or(u64::MAX),
                "attempt failed, retrying"
            );
            write_log(
                log.as_ref(),
                "warn",
                &format!(
                    "{} failed with {code}; retrying in {:?} (attempt {attempt}/{max_attempts})",
                    job.spec.op.as_str(),
                    decision.delay
                ),
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(decision.delay) => {}
            }
            from = JobState::RetryWaiting;
        }
    }

    fn finish(
        &self,
        id: JobId,
        outcome: JobState,
        classification: Option<Classification>,
        log: Option<&Arc<JobLog>>,
    ) {
        let summary = match &classification {
            Some(cls) => format!("job {outcome}: {}", cls.display_message()),
            None => format!("job {outcome}"),
        };
        match self
            .store
            .compare_and_transition(id, JobState::Running, outcome, |j| {
                j.last_error = classification;
            }) {
            Ok(job) => {
                info!(job_id = %id, state = %outcome, attempt_count = job.attempt_count, "job finished");
                write_log(log, "info", &summary);
            }
            Err(err) => debug!(job_id = %id, err = %err, "job moved before it could finish"),
        }
    }
}

fn write_log(log: Option<&Arc<JobLog>>, level: &str, line: &str) {
    if let Some(log) = log
        && let Err(err) = log.append(level, line)
    {
        warn!(path = %log.path().display(), err = %format!("{err:#}"), "job log write failed");
    }
}
