//! Core domain types shared by the job store, runner and CLI.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::classifier::Classification;
use crate::core::state::JobState;

/// Unique job identifier (UUIDv7, so ids sort by creation time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Transfer operation performed by the external tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOp {
    Sync,
    #[default]
    Copy,
    Move,
}

impl TransferOp {
    /// Subcommand name passed to the transfer tool.
    pub fn as_str(self) -> &'static str {
        match self {
            TransferOp::Sync => "sync",
            TransferOp::Copy => "copy",
            TransferOp::Move => "move",
        }
    }
}

/// What a job should transfer. Opaque to the engine apart from argv assembly.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSpec {
    pub op: TransferOp,
    pub source: String,
    pub destination: String,
    /// Extra flags appended verbatim after the destination.
    pub flags: Vec<String>,
}

impl TransferSpec {
    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(anyhow!("source must be non-empty"));
        }
        if self.destination.trim().is_empty() {
            return Err(anyhow!("destination must be non-empty"));
        }
        Ok(())
    }

    /// Short human label, e.g. `copy s3:a -> gcs:b`.
    pub fn label(&self) -> String {
        format!(
            "{} {} -> {}",
            self.op.as_str(),
            self.source,
            self.destination
        )
    }
}

/// Persisted job record (`jobs/<id>.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub spec: TransferSpec,
    pub state: JobState,
    /// Attempts started so far. Survives restarts.
    pub attempt_count: u32,
    /// Classification of the most recent failed attempt.
    pub last_error: Option<Classification>,
    pub log_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId, spec: TransferSpec, log_path: PathBuf, now: DateTime<Utc>) -> Self {
        Self {
            id,
            spec,
            state: JobState::Pending,
            attempt_count: 0,
            last_error: None,
            log_path,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn status(&self) -> StatusReport {
        StatusReport::from(self)
    }
}

/// Read-only status view of a job as exposed to API clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub id: JobId,
    pub state: JobState,
    pub attempt_count: u32,
    pub last_error_code: Option<String>,
    pub last_error_retryable: Option<bool>,
    pub last_error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for StatusReport {
    fn from(job: &Job) -> Self {
        let last = job.last_error.as_ref();
        Self {
            id: job.id,
            state: job.state,
            attempt_count: job.attempt_count,
            last_error_code: last.map(|cls| cls.code.as_str().to_string()),
            last_error_retryable: last.map(|cls| cls.retryable),
            last_error_message: last.map(Classification::display_message),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Why a single attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttemptError {
    /// The attempt was stopped by a cancel request or shutdown.
    #[error("canceled")]
    Canceled,
    /// The attempt exceeded its maximum duration and was killed.
    #[error("attempt timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error("{}", exit_text(.code))]
    Exited { code: Option<i32> },
    /// The transfer tool could not be started.
    #[error("spawn transfer tool: {0}")]
    Spawn(String),
}

fn exit_text(code: &Option<i32>) -> String {
    match *code {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::ErrorCode;

    fn sample_job() -> Job {
        let now = Utc::now();
        Job::new(
            JobId::new(),
            TransferSpec {
                op: TransferOp::Sync,
                source: "s3:src".to_string(),
                destination: "gcs:dst".to_string(),
                flags: vec!["--checksum".to_string()],
            },
            PathBuf::from("logs/jobs/x.log"),
            now,
        )
    }

    #[test]
    fn job_ids_parse_back() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().expect("parse");
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn job_ids_sort_by_creation() {
        let first = JobId::new();
        let second = JobId::new();
        assert!(first < second);
    }

    #[test]
    fn transfer_spec_requires_endpoints() {
        let mut spec = TransferSpec {
            source: "a:".to_string(),
            ..TransferSpec::default()
        };
        assert!(spec.validate().is_err());
        spec.destination = "b:".to_string();
        spec.validate().expect("valid");
        assert_eq!(spec.label(), "copy a: -> b:");
    }

    #[test]
    fn status_report_uses_camel_case() {
        let mut job = sample_job();
        job.attempt_count = 2;
        job.last_error = Some(Classification::new(
            ErrorCode::RateLimited,
            "SlowDown: please reduce your request rate",
        ));

        let value = serde_json::to_value(job.status()).expect("serialize");
        assert_eq!(value["attemptCount"], 2);
        assert_eq!(value["lastErrorCode"], "rate_limited");
        assert_eq!(value["lastErrorRetryable"], true);
        assert_eq!(
            value["lastErrorMessage"],
            "[rate_limited] SlowDown: please reduce your request rate"
        );
        assert_eq!(value["state"], "pending");
    }

    #[test]
    fn job_record_tolerates_missing_timestamps() {
        let job = sample_job();
        let mut value = serde_json::to_value(&job).expect("serialize");
        let obj = value.as_object_mut().expect("object");
        obj.remove("started_at");
        obj.remove("finished_at");
        let parsed: Job = serde_json::from_value(value).expect("parse");
        assert_eq!(parsed.started_at, None);
        assert_eq!(parsed.id, job.id);
    }

    #[test]
    fn attempt_error_messages() {
        assert_eq!(
            AttemptError::Exited { code: Some(1) }.to_string(),
            "exit status 1"
        );
        assert_eq!(
            AttemptError::TimedOut(Duration::from_secs(90)).to_string(),
            "attempt timed out after 90s"
        );
    }
}
