//! The transfer tool boundary.
//!
//! The runner only sees the [`Transfer`] trait, so retry and recovery logic is
//! tested with scripted transfers while production runs the external tool
//! through [`CommandTransfer`].

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::core::types::{AttemptError, JobId, TransferSpec};
use crate::io::job_log::JobLog;
use crate::io::process::run_streaming;

/// Everything one attempt needs.
#[derive(Debug, Clone)]
pub struct AttemptRequest {
    pub job_id: JobId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub spec: TransferSpec,
    pub timeout: Duration,
    /// Destination for the tool's output lines.
    pub log: Option<Arc<JobLog>>,
}

/// Result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutput {
    pub result: Result<(), AttemptError>,
    /// Tail of the tool's stderr, newline-joined.
    pub stderr_tail: String,
}

impl AttemptOutput {
    pub fn succeeded() -> Self {
        Self {
            result: Ok(()),
            stderr_tail: String::new(),
        }
    }

    pub fn failed(error: AttemptError, stderr_tail: impl Into<String>) -> Self {
        Self {
            result: Err(error),
            stderr_tail: stderr_tail.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn exit_code(&self) -> Option<i32> {
        match &self.result {
            Ok(()) => Some(0),
            Err(AttemptError::Exited { code }) => *code,
            Err(_) => None,
        }
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.result, Err(AttemptError::TimedOut(_)))
    }
}

/// Executes one transfer attempt.
///
/// Implementations must stop promptly when `cancel` fires and report
/// [`AttemptError::Canceled`].
#[async_trait]
pub trait Transfer: Send + Sync {
    async fn run(&self, request: &AttemptRequest, cancel: &CancellationToken) -> AttemptOutput;
}

/// Runs the external transfer tool as a subprocess.
#[derive(Debug, Clone)]
pub struct CommandTransfer {
    program: OsString,
    args: Vec<OsString>,
}

impl CommandTransfer {
    /// `command` is the program followed by leading arguments
    /// (e.g. `["rclone", "--config", "/etc/rclone.conf"]`).
    pub fn new(command: &[String]) -> anyhow::Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("transfer command must be non-empty"))?;
        Ok(Self {
            program: OsString::from(program),
            args: args.iter().map(OsString::from).collect(),
        })
    }

    /// Full argument vector (after the program) for `spec`.
    pub fn argv(&self, spec: &TransferSpec) -> Vec<OsString> {
        let mut argv = self.args.clone();
        argv.push(spec.op.as_str().into());
        argv.push(spec.source.clone().into());
        argv.push(spec.destination.clone().into());
        argv.extend(spec.flags.iter().map(OsString::from));
        argv
    }
}

#[async_trait]
impl Transfer for CommandTransfer {
    #[instrument(skip_all, fields(job_id = %request.job_id, attempt = request.attempt))]
    async fn run(&self, request: &AttemptRequest, cancel: &CancellationToken) -> AttemptOutput {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.argv(&request.spec));

        info!(op = request.spec.op.as_str(), "starting transfer");
        let out = match run_streaming(cmd, request.timeout, cancel, request.log.clone()).await {
            Ok(out) => out,
            Err(err) => return AttemptOutput::failed(AttemptError::Spawn(format!("{err:#}")), ""),
        };

        let stderr_tail = out.stderr_text();
        if out.canceled {
            return AttemptOutput::failed(AttemptError::Canceled, stderr_tail);
        }
        if out.timed_out {
            return AttemptOutput::failed(AttemptError::TimedOut(request.timeout), stderr_tail);
        }
        match out.status {
            Some(status) if status.success() => AttemptOutput {
                result: Ok(()),
                stderr_tail,
            },
            Some(status) => AttemptOutput::failed(
                AttemptError::Exited {
                    code: status.code(),
                },
                stderr_tail,
            ),
            None => AttemptOutput::failed(AttemptError::Exited { code: None }, stderr_tail),
        }
    }
}
