//! Per-job log files under `logs/jobs/<id>.log`.
//!
//! Every attempt appends its header, the tool's output lines and the retry
//! decision. Transfers can be chatty, so each file has a byte ceiling: once a
//! write crosses it, the file is rewritten to a truncation marker followed by
//! the most recent output.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};

pub const TRUNCATION_MARKER: &str = "[earlier output truncated]\n";

/// Appending, size-bounded log for one job.
#[derive(Debug)]
pub struct JobLog {
    path: PathBuf,
    /// `0` means unbounded.
    max_bytes: u64,
    file: Mutex<File>,
}

impl JobLog {
    pub fn open(path: &Path, max_bytes: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .with_context(|| format!("open job log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            max_bytes,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `[level] line` and enforce the ceiling.
    pub fn append(&self, level: &str, line: &str) -> Result<()> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = format!("[{level}] {}\n", line.trim_end_matches(['\r', '\n']));
        file.write_all(entry.as_bytes())
            .with_context(|| format!("append job log {}", self.path.display()))?;

        if self.max_bytes > 0 {
            let len = file
                .metadata()
                .with_context(|| format!("stat job log {}", self.path.display()))?
                .len();
            if len > self.max_bytes {
                self.keep_tail(&mut file, len)?;
            }
        }
        Ok(())
    }

    fn keep_tail(&self, file: &mut File, len: u64) -> Result<()> {
        let marker_len = TRUNCATION_MARKER.len() as u64;
        // Leave headroom so the rewrite does not happen on every line.
        let budget = self
            .max_bytes
            .saturating_sub(self.max_bytes / 4)
            .saturating_sub(marker_len);

        let start = len.saturating_sub(budget);
        file.seek(SeekFrom::Start(start))
            .with_context(|| format!("seek job log {}", self.path.display()))?;
        let mut tail = Vec::with_capacity(usize::try_from(budget).unwrap_or(0));
        file.read_to_end(&mut tail)
            .with_context(|| format!("read job log {}", self.path.display()))?;

        // Start at a line boundary.
        let tail = match tail.iter().position(|b| *b == b'\n') {
            Some(idx) if start > 0 => &tail[idx + 1..],
            _ => &tail[..],
        };

        let mut rewritten = Vec::with_capacity(TRUNCATION_MARKER.len() + tail.len());
        if self.max_bytes >= marker_len {
            rewritten.extend_from_slice(TRUNCATION_MARKER.as_bytes());
        }
        rewritten.extend_from_slice(tail);
        let cap = usize::try_from(self.max_bytes).unwrap_or(usize::MAX);
        if rewritten.len() > cap {
            let cut = rewritten.len() - cap;
            rewritten.drain(..cut);
        }

        file.set_len(0)
            .with_context(|| format!("truncate job log {}", self.path.display()))?;
        file.write_all(&rewritten)
            .with_context(|| format!("rewrite job log {}", self.path.display()))?;
        Ok(())
    }
}
