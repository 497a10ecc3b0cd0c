//! CLI tests for the `engine` binary.
//!
//! Spawns the binary and checks exit codes and output for `status`,
//! `lock-info` and `serve --exit-when-idle` against a shell script standing
//! in for the transfer tool.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use engine::core::state::JobState;
use engine::exit_codes;
use engine::io::job_store::JobStore;
use engine::io::lock::DirectoryLock;
use engine::test_support::{data_dir, transfer_spec};

fn engine(args: &[&str]) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_engine"));
    cmd.args(args).env("RUST_LOG", "engine=warn");
    cmd
}

fn run(cmd: &mut Command) -> Output {
    cmd.output().expect("run engine binary")
}

fn write_job(dir: &Path) -> String {
    let path = dir.join("job.toml");
    fs::write(&path, "source = \"s3:photos\"\ndestination = \"gcs:backup\"\n")
        .expect("write job");
    path.to_string_lossy().into_owned()
}

/// A stand-in transfer tool that prints `stderr` and exits with `code`.
fn write_tool(dir: &Path, stderr: &str, code: i32) -> String {
    let path = dir.join("tool.sh");
    fs::write(&path, format!("#!/bin/sh\necho '{stderr}' >&2\nexit {code}\n"))
        .expect("write tool");
    format!("sh {}", path.display())
}

#[test]
fn status_json_lists_all_jobs() {
    let dir = data_dir();
    {
        let (store, _) = JobStore::open(dir.path()).expect("open");
        store.create(transfer_spec("a")).expect("create");
        let done = store.create(transfer_spec("b")).expect("create");
        store
            .compare_and_transition(done.id, JobState::Pending, JobState::Canceled, |_| {})
            .expect("cancel");
    }
    let data = dir.path().to_string_lossy().into_owned();

    let out = run(&mut engine(&["status", "--data-dir", &data, "--json", "--all"]));
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let reports: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json");
    assert_eq!(reports.as_array().map(Vec::len), Some(2));

    let out = run(&mut engine(&["status", "--data-dir", &data]));
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let table = String::from_utf8_lossy(&out.stdout);
    assert!(table.contains("pending"));
    assert!(!table.contains("canceled"));
}

#[test]
fn lock_info_reports_holder() {
    let dir = data_dir();
    let data = dir.path().to_string_lossy().into_owned();

    let out = run(&mut engine(&["lock-info", "--data-dir", &data]));
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&out.stdout).contains("no lock file"));

    let _lock = DirectoryLock::acquire(dir.path()).expect("lock");
    let out = run(&mut engine(&["lock-info", "--data-dir", &data]));
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains(&format!("pid={}", std::process::id())), "{stdout}");
}

#[test]
fn serve_on_locked_directory_exits_locked() {
    let dir = data_dir();
    let _lock = DirectoryLock::acquire(dir.path()).expect("lock");
    let data = dir.path().to_string_lossy().into_owned();

    let out = run(&mut engine(&["serve", "--data-dir", &data, "--exit-when-idle"]));
    assert_eq!(out.status.code(), Some(exit_codes::LOCKED));
}

#[cfg(unix)]
#[test]
fn serve_exit_code_reflects_job_outcome() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let job = write_job(scratch.path());

    let ok_dir = data_dir();
    let ok_data = ok_dir.path().to_string_lossy().into_owned();
    let out = run(engine(&["serve", "--data-dir", &ok_data, "--job", &job, "--exit-when-idle"])
        .env("ENGINE_TRANSFER_COMMAND", write_tool(scratch.path(), "done", 0)));
    assert_eq!(out.status.code(), Some(exit_codes::OK));

    let failed_dir = data_dir();
    let failed_data = failed_dir.path().to_string_lossy().into_owned();
    let out = run(engine(&["serve", "--data-dir", &failed_data, "--job", &job, "--exit-when-idle"])
        .env(
            "ENGINE_TRANSFER_COMMAND",
            write_tool(scratch.path(), "AccessDenied: Access Denied.", 1),
        ));
    assert_eq!(out.status.code(), Some(exit_codes::JOBS_FAILED));

    let out = run(&mut engine(&["status", "--data-dir", &failed_data, "--json", "--all"]));
    let reports: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json");
    assert_eq!(reports[0]["state"], "failed");
    assert_eq!(reports[0]["attemptCount"], 1);
}

#[test]
fn serve_rejects_invalid_config() {
    let dir = data_dir();
    fs::write(dir.path().join("config.toml"), "job_concurrency = 0\n").expect("config");
    let data = dir.path().to_string_lossy().into_owned();

    let out = run(&mut engine(&["serve", "--data-dir", &data, "--exit-when-idle"]));
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
}
