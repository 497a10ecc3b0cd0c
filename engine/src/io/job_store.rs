//! Durable job records under `<data_dir>/jobs/<id>.json`.
//!
//! One pretty-printed JSON file per job, replaced atomically (temp file +
//! rename) on every transition. An in-memory index behind a mutex serializes
//! writers; readers get clones, so nobody observes a half-applied transition.
//!
//! Opening the store doubles as crash recovery: jobs found `running` or
//! `retry_waiting` were interrupted mid-flight and go back to `pending` with
//! their attempt count intact.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::core::classifier::{Classification, ErrorCode};
use crate::core::state::JobState;
use crate::core::types::{Job, JobId, StatusReport, TransferSpec};

const RECORD_EXT: &str = "json";
const TEMP_EXT: &str = "json.tmp";
const CORRUPT_EXT: &str = "json.corrupt";

pub fn jobs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("jobs")
}

pub fn job_logs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs").join("jobs")
}

/// Why a compare-and-transition was refused.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {id} is {actual}, expected {expected}")]
    StateMismatch {
        id: JobId,
        expected: JobState,
        actual: JobState,
    },
    #[error("job {id}: illegal transition {from} -> {to}")]
    Invalid {
        id: JobId,
        from: JobState,
        to: JobState,
    },
    #[error("job {id}: attempt count cannot go from {from} to {to}")]
    AttemptCountDecreased { id: JobId, from: u32, to: u32 },
    #[error(transparent)]
    Persist(#[from] anyhow::Error),
}

/// What [`JobStore::open`] found on disk.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub loaded: usize,
    /// Interrupted jobs moved back to `pending`.
    pub requeued: Vec<JobId>,
    /// Unreadable records, renamed to `<id>.json.corrupt`.
    pub corrupt: Vec<PathBuf>,
    /// Leftover temp files from an interrupted write.
    pub removed_temp: usize,
}

/// One entry found while scanning the jobs directory.
#[derive(Debug)]
pub enum ScannedRecord {
    Job(Box<Job>),
    Corrupt { path: PathBuf, error: String },
    Temp(PathBuf),
}

/// Read every record in `jobs_dir` without modifying anything.
pub fn scan_records(jobs_dir: &Path) -> Result<Vec<ScannedRecord>> {
    if !jobs_dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(jobs_dir)
        .with_context(|| format!("read {}", jobs_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    let mut records = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if name.ends_with(&format!(".{TEMP_EXT}")) {
            records.push(ScannedRecord::Temp(path));
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
            continue;
        }
        let parsed = fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))
            .and_then(|raw| {
                serde_json::from_str::<Job>(&raw)
                    .with_context(|| format!("parse {}", path.display()))
            });
        match parsed {
            Ok(job) => records.push(ScannedRecord::Job(Box::new(job))),
            Err(err) => records.push(ScannedRecord::Corrupt {
                path,
                error: format!("{err:#}"),
            }),
        }
    }
    Ok(records)
}

/// Durable, mutex-serialized job index.
///
/// Writes are small synchronous file replacements made while the index lock is
/// held, so the on-disk order of transitions matches the in-memory order.
/// Async callers call it inline; each write blocks one runtime worker for a
/// single small file write, bounded by the job concurrency.
#[derive(Debug)]
pub struct JobStore {
    jobs_dir: PathBuf,
    logs_dir: PathBuf,
    inner: Mutex<BTreeMap<JobId, Job>>,
}

impl JobStore {
    /// Load all records under `data_dir`, recovering interrupted jobs.
    pub fn open(data_dir: &Path) -> Result<(Self, RecoveryReport)> {
        let jobs_dir = jobs_dir(data_dir);
        let logs_dir = job_logs_dir(data_dir);
        fs::create_dir_all(&jobs_dir)
            .with_context(|| format!("create directory {}", jobs_dir.display()))?;
        fs::create_dir_all(&logs_dir)
            .with_context(|| format!("create directory {}", logs_dir.display()))?;

        let store = Self {
            jobs_dir,
            logs_dir,
            inner: Mutex::new(BTreeMap::new()),
        };
        let report = store.recover()?;
        info!(
            loaded = report.loaded,
            requeued = report.requeued.len(),
            corrupt = report.corrupt.len(),
            "job store opened"
        );
        Ok((store, report))
    }

    fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let now = Utc::now();
        let mut jobs = self.lock();

        for record in scan_records(&self.jobs_dir)? {
            match record {
                ScannedRecord::Temp(path) => {
                    debug!(path = %path.display(), "removing leftover temp record");
                    match fs::remove_file(&path) {
                        Ok(()) => report.removed_temp += 1,
                        Err(err) => {
                            warn!(path = %path.display(), err = %err, "cannot remove temp record");
                        }
                    }
                }
                ScannedRecord::Job(job) => {
                    let mut job = *job;
                    if matches!(job.state, JobState::Running | JobState::RetryWaiting) {
                        info!(
                            job_id = %job.id,
                            state = %job.state,
                            attempt_count = job.attempt_count,
                            "requeueing interrupted job"
                        );
                        job.state = JobState::Pending;
                        job.updated_at = now;
                        // Kept pending in memory; the next transition rewrites it.
                        if let Err(err) = self.write_record(&job) {
                            warn!(
                                job_id = %job.id,
                                err = %format!("{err:#}"),
                                "cannot persist requeued job"
                            );
                        }
                        report.requeued.push(job.id);
                    }
                    report.loaded += 1;
                    jobs.insert(job.id, job);
                }
                ScannedRecord::Corrupt { path, error } => {
                    warn!(path = %path.display(), err = %error, "corrupt job record");
                    match self.quarantine(&path, &error, now) {
                        Ok(Some(job)) => {
                            report.loaded += 1;
                            jobs.insert(job.id, job);
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(
                                path = %path.display(),
                                err = %format!("{err:#}"),
                                "cannot quarantine corrupt record"
                            );
                        }
                    }
                    report.corrupt.push(path);
                }
            }
        }
        Ok(report)
    }

    /// Preserve an unreadable record and replace it with a failed stub so the
    /// job stays visible to status queries.
    fn quarantine(&self, path: &Path, error: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let preserved = path.with_extension(CORRUPT_EXT);
        fs::rename(path, &preserved)
            .with_context(|| format!("preserve corrupt record {}", path.display()))?;

        let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<JobId>().ok())
        else {
            return Ok(None);
        };

        let mut job = Job::new(id, TransferSpec::default(), self.log_path_for(id), now);
        job.state = JobState::Failed;
        job.finished_at = Some(now);
        job.last_error = Some(Classification::new(
            ErrorCode::Unknown,
            format!("corrupt job record: {error}"),
        ));
        self.write_record(&job)?;
        Ok(Some(job))
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<JobId, Job>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_path(&self, id: JobId) -> PathBuf {
        self.jobs_dir.join(format!("{id}.{RECORD_EXT}"))
    }

    pub fn log_path_for(&self, id: JobId) -> PathBuf {
        self.logs_dir.join(format!("{id}.log"))
    }

    fn write_record(&self, job: &Job) -> Result<()> {
        let path = self.record_path(job.id);
        debug!(job_id = %job.id, state = %job.state, "writing job record");
        let mut buf = serde_json::to_string_pretty(job).context("serialize job record")?;
        buf.push('\n');
        write_atomic(&path, &buf)
    }

    /// Persist a new `pending` job.
    pub fn create(&self, spec: TransferSpec) -> Result<Job> {
        spec.validate()?;
        let id = JobId::new();
        let job = Job::new(id, spec, self.log_path_for(id), Utc::now());
        let mut jobs = self.lock();
        self.write_record(&job)?;
        jobs.insert(id, job.clone());
        Ok(job)
    }

    pub fn load(&self, id: JobId) -> Option<Job> {
        self.lock().get(&id).cloned()
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Vec<Job> {
        self.lock().values().cloned().collect()
    }

    /// Non-terminal jobs, oldest first.
    pub fn list_active(&self) -> Vec<Job> {
        self.lock()
            .values()
            .filter(|job| !job.state.is_terminal())
            .cloned()
            .collect()
    }

    pub fn status(&self, id: JobId) -> Option<StatusReport> {
        self.lock().get(&id).map(Job::status)
    }

    /// Atomically move `id` from `expected` to `next`, applying `update` to the
    /// record first.
    ///
    /// Fails without side effects when the job is not in `expected` (someone
    /// else moved it) or the edge is not part of the state machine. The new
    /// record is on disk before any reader can see it. `started_at` and
    /// `finished_at` are stamped here.
    pub fn compare_and_transition(
        &self,
        id: JobId,
        expected: JobState,
        next: JobState,
        update: impl FnOnce(&mut Job),
    ) -> Result<Job, TransitionError> {
        let mut jobs = self.lock();
        let current = jobs.get(&id).ok_or(TransitionError::NotFound(id))?;
        if current.state != expected {
            return Err(TransitionError::StateMismatch {
                id,
                expected,
                actual: current.state,
            });
        }
        if !expected.can_transition_to(next) {
            return Err(TransitionError::Invalid {
                id,
                from: expected,
                to: next,
            });
        }

        let mut job = current.clone();
        update(&mut job);
        if job.attempt_count < current.attempt_count {
            return Err(TransitionError::AttemptCountDecreased {
                id,
                from: current.attempt_count,
                to: job.attempt_count,
            });
        }
        let now = Utc::now();
        job.state = next;
        job.updated_at = now;
        if next == JobState::Running && job.started_at.is_none() {
            job.started_at = Some(now);
        }
        if next.is_terminal() {
            job.finished_at = Some(now);
        }

        self.write_record(&job)?;
        jobs.insert(id, job.clone());
        Ok(job)
    }

    /// Delete terminal jobs last updated before `now - retention`, with their
    /// logs. Non-terminal jobs are never touched.
    pub fn purge_older_than(&self, retention: Duration, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let retention = chrono::Duration::from_std(retention).context("retention out of range")?;
        let cutoff = now - retention;

        let mut jobs = self.lock();
        let expired: Vec<JobId> = jobs
            .values()
            .filter(|job| job.state.is_terminal() && job.updated_at < cutoff)
            .map(|job| job.id)
            .collect();

        for id in &expired {
            let record = self.record_path(*id);
            remove_if_exists(&record)?;
            if let Some(job) = jobs.remove(id) {
                remove_if_exists(&job.log_path)?;
            }
            debug!(job_id = %id, "purged expired job");
        }
        Ok(expired)
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("job record path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension(TEMP_EXT);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp job record {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace job record {}", path.display()))?;
    Ok(())
}
