//! Best-effort capture of failure output that no classifier rule matched.
//!
//! Samples land in `logs/unknown-errors/` so operators can grow the rule table
//! from real provider messages. Capture never fails the job.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::core::types::JobId;

/// Samples are capped to this many bytes of stderr.
pub const MAX_SAMPLE_BYTES: usize = 8 * 1024;

pub fn capture_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs").join("unknown-errors")
}

/// Write one sample. Errors are logged and swallowed.
pub fn maybe_capture(
    data_dir: &Path,
    job_id: JobId,
    context: &str,
    stderr: &str,
    now: DateTime<Utc>,
) -> Option<PathBuf> {
    let sample = stderr.trim();
    if sample.is_empty() {
        return None;
    }
    match write_sample(&capture_dir(data_dir), job_id, context, sample, now) {
        Ok(path) => {
            debug!(job_id = %job_id, path = %path.display(), "captured unknown error sample");
            Some(path)
        }
        Err(err) => {
            warn!(job_id = %job_id, err = %format!("{err:#}"), "failed to capture unknown error");
            None
        }
    }
}

fn write_sample(
    dir: &Path,
    job_id: JobId,
    context: &str,
    sample: &str,
    now: DateTime<Utc>,
) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

    let sample = truncate_at_char_boundary(sample, MAX_SAMPLE_BYTES);
    let digest = Sha256::digest(sample.as_bytes());
    let name = format!(
        "{}_{}.txt",
        now.format("%Y%m%dT%H%M%S%.3fZ"),
        hex::encode(&digest[..4])
    );
    let path = dir.join(name);

    let body = format!(
        "captured_at={}\njob_id={job_id}\ncontext={context}\n\n{sample}\n",
        now.to_rfc3339()
    );
    fs::write(&path, body).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

fn truncate_at_char_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_header_and_sample() {
        let temp = tempfile::tempdir().expect("tempdir");
        let id = JobId::new();
        let path = maybe_capture(temp.path(), id, "copy", "weird backend failure\n", Utc::now())
            .expect("captured");

        assert!(path.starts_with(capture_dir(temp.path())));
        let name = path.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.ends_with(".txt"));

        let contents = fs::read_to_string(&path).expect("read");
        assert!(contents.starts_with("captured_at="));
        assert!(contents.contains(&format!("job_id={id}\n")));
        assert!(contents.contains("context=copy\n"));
        assert!(contents.ends_with("weird backend failure\n"));
    }

    #[test]
    fn caps_sample_size() {
        let temp = tempfile::tempdir().expect("tempdir");
        let big = "é".repeat(MAX_SAMPLE_BYTES);
        let path = maybe_capture(temp.path(), JobId::new(), "sync", &big, Utc::now())
            .expect("captured");
        let contents = fs::read_to_string(&path).expect("read");
        let body = contents.split("\n\n").nth(1).expect("body");
        assert!(body.len() <= MAX_SAMPLE_BYTES + 1);
    }

    #[test]
    fn skips_empty_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(maybe_capture(temp.path(), JobId::new(), "copy", "  \n", Utc::now()).is_none());
        assert!(!capture_dir(temp.path()).exists());
    }
}
