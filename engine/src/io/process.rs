//! Helpers for running child processes with timeouts, cancellation and
//! streamed output.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::io::job_log::JobLog;

/// Stderr lines kept in memory for classification.
pub const STDERR_TAIL_LINES: usize = 50;

/// Longer lines are cut before being logged or kept.
pub const MAX_LINE_BYTES: usize = 16 * 1024;

/// How long to wait for output readers after the child is gone. Grandchildren
/// that inherited the pipes can keep them open indefinitely.
const PUMP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How a streamed child process ended.
#[derive(Debug)]
pub struct StreamedOutput {
    /// `None` when the child was killed by us.
    pub status: Option<ExitStatus>,
    pub timed_out: bool,
    pub canceled: bool,
    /// Last [`STDERR_TAIL_LINES`] stderr lines, oldest first.
    pub stderr_tail: Vec<String>,
}

impl StreamedOutput {
    pub fn stderr_text(&self) -> String {
        self.stderr_tail.join("\n")
    }
}

enum Stop {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Canceled,
}

/// Run `cmd`, teeing stdout/stderr lines into `log`, until it exits, exceeds
/// `timeout`, or `cancel` fires. On timeout or cancel the child is killed.
///
/// Only spawn and wait failures are errors. A non-zero exit is reported via
/// `status`.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub async fn run_streaming(
    mut cmd: Command,
    timeout: Duration,
    cancel: &CancellationToken,
    log: Option<Arc<JobLog>>,
) -> Result<StreamedOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = tokio::spawn(pump_lines(stdout, "stdout", log.clone(), 0));
    let stderr_handle = tokio::spawn(pump_lines(stderr, "stderr", log, STDERR_TAIL_LINES));

    let stop = tokio::select! {
        status = child.wait() => Stop::Exited(status),
        () = tokio::time::sleep(timeout) => Stop::TimedOut,
        () = cancel.cancelled() => Stop::Canceled,
    };

    let (status, timed_out, canceled) = match stop {
        Stop::Exited(status) => (Some(status.context("wait for command")?), false, false),
        Stop::TimedOut => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            kill(&mut child).await;
            (None, true, false)
        }
        Stop::Canceled => {
            debug!("command canceled, killing");
            kill(&mut child).await;
            (None, false, true)
        }
    };

    join_pump(stdout_handle, "stdout").await;
    let stderr_tail = join_pump(stderr_handle, "stderr").await;

    debug!(exit_code = ?status.and_then(|s| s.code()), timed_out, canceled, "command finished");
    Ok(StreamedOutput {
        status,
        timed_out,
        canceled,
        stderr_tail: stderr_tail.into_iter().collect(),
    })
}

async fn kill(child: &mut Child) {
    if let Err(err) = child.kill().await {
        warn!(err = %err, "failed to kill child process");
    }
}

async fn join_pump(mut handle: JoinHandle<VecDeque<String>>, label: &str) -> VecDeque<String> {
    match tokio::time::timeout(PUMP_JOIN_TIMEOUT, &mut handle).await {
        Ok(Ok(lines)) => lines,
        Ok(Err(err)) => {
            warn!(stream = label, err = %err, "output reader task failed");
            VecDeque::new()
        }
        Err(_) => {
            warn!(stream = label, "output reader did not finish, abandoning");
            handle.abort();
            VecDeque::new()
        }
    }
}

/// Read `reader` line by line, append each line to `log`, and keep the last
/// `keep` lines.
///
/// At most [`MAX_LINE_BYTES`] of a line are buffered; the rest of an overlong
/// line is drained and dropped up to the next newline.
async fn pump_lines<R>(
    reader: R,
    label: &'static str,
    log: Option<Arc<JobLog>>,
    keep: usize,
) -> VecDeque<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut sink = LineSink {
        label,
        log,
        log_failed: false,
        keep,
        tail: VecDeque::with_capacity(keep),
    };
    let mut line = Vec::with_capacity(1024);
    let mut pending = false;

    loop {
        let chunk = match reader.fill_buf().await {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(stream = label, err = %err, "read child output");
                break;
            }
        };
        if chunk.is_empty() {
            break;
        }
        let newline = chunk.iter().position(|&b| b == b'\n');
        let used = newline.map_or(chunk.len(), |idx| idx + 1);
        let room = MAX_LINE_BYTES.saturating_sub(line.len());
        line.extend_from_slice(&chunk[..used.min(room)]);
        reader.consume(used);
        pending = true;

        if newline.is_some() {
            sink.push(&line);
            line.clear();
            pending = false;
        }
    }
    if pending {
        sink.push(&line);
    }
    sink.tail
}

struct LineSink {
    label: &'static str,
    log: Option<Arc<JobLog>>,
    log_failed: bool,
    keep: usize,
    tail: VecDeque<String>,
}

impl LineSink {
    fn push(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some(log) = &self.log
            && !self.log_failed
            && let Err(err) = log.append(self.label, line)
        {
            warn!(stream = self.label, err = %format!("{err:#}"), "job log write failed");
            self.log_failed = true;
        }

        if self.keep > 0 {
            if self.tail.len() == self.keep {
                self.tail.pop_front();
            }
            self.tail.push_back(line.to_string());
        }
    }
}
