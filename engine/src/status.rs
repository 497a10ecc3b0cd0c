//! `engine status`: read-only job listing.
//!
//! Reads the job records directly and never takes the directory lock, so it
//! works while an engine is serving the same directory.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

use crate::core::types::StatusReport;
use crate::io::job_store::{ScannedRecord, jobs_dir, scan_records};

/// Status of jobs under `data_dir`, oldest first. Terminal jobs are included
/// only with `all`.
pub fn collect_status(data_dir: &Path, all: bool) -> Result<Vec<StatusReport>> {
    let mut reports = Vec::new();
    for record in scan_records(&jobs_dir(data_dir))? {
        match record {
            ScannedRecord::Job(job) => {
                if all || !job.state.is_terminal() {
                    reports.push(job.status());
                }
            }
            ScannedRecord::Corrupt { path, error } => {
                warn!(path = %path.display(), err = %error, "skipping unreadable job record");
            }
            ScannedRecord::Temp(_) => {}
        }
    }
    reports.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    Ok(reports)
}

pub fn render_json(reports: &[StatusReport]) -> Result<String> {
    let mut buf = serde_json::to_string_pretty(reports).context("serialize status")?;
    buf.push('\n');
    Ok(buf)
}

pub fn render_table(reports: &[StatusReport]) -> String {
    if reports.is_empty() {
        return "no jobs\n".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<36}  {:<13}  {:>8}  {:<20}  LAST ERROR",
        "ID", "STATE", "ATTEMPTS", "UPDATED"
    );
    for report in reports {
        let _ = writeln!(
            out,
            "{:<36}  {:<13}  {:>8}  {:<20}  {}",
            report.id,
            report.state.as_str(),
            report.attempt_count,
            report.updated_at.format("%Y-%m-%d %H:%M:%S"),
            report.last_error_message.as_deref().unwrap_or("-"),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::JobState;
    use crate::core::types::{TransferOp, TransferSpec};
    use crate::io::job_store::JobStore;

    fn spec() -> TransferSpec {
        TransferSpec {
            op: TransferOp::Copy,
            source: "s3:a".to_string(),
            destination: "s3:b".to_string(),
            flags: Vec::new(),
        }
    }

    #[test]
    fn hides_terminal_jobs_unless_all() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (store, _) = JobStore::open(temp.path()).expect("open");
        let live = store.create(spec()).expect("create");
        let done = store.create(spec()).expect("create");
        store
            .compare_and_transition(done.id, JobState::Pending, JobState::Canceled, |_| {})
            .expect("cancel");

        let active = collect_status(temp.path(), false).expect("status");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, live.id);

        let all = collect_status(temp.path(), true).expect("status");
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn missing_data_dir_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let reports = collect_status(&temp.path().join("nope"), true).expect("status");
        assert!(reports.is_empty());
        assert_eq!(render_table(&reports), "no jobs\n");
    }

    #[test]
    fn renders_table_and_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (store, _) = JobStore::open(temp.path()).expect("open");
        let job = store.create(spec()).expect("create");
        let reports = collect_status(temp.path(), true).expect("status");

        let table = render_table(&reports);
        assert!(table.starts_with("ID"));
        assert!(table.contains(&job.id.to_string()));
        assert!(table.contains("pending"));

        let json = render_json(&reports).expect("json");
        let value: serde_json::Value = serde_json::from_str(&json).expect("parse");
        assert_eq!(value[0]["attemptCount"], 0);
        assert_eq!(value[0]["state"], "pending");
    }
}
