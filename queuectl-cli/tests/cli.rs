//! End-to-end checks of the admin surface through the real binary.

use std::path::Path;
use std::process::{Command, Output};

fn queuectl(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_queuectl"))
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run queuectl")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_init_is_idempotent() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");

    let first = queuectl(dir.path(), &["init"]);
    assert!(first.status.success());
    assert!(dir.path().join("queue.db").exists());

    let second = queuectl(dir.path(), &["init"]);
    assert!(second.status.success());
}

#[test]
fn test_enqueue_list_and_duplicate_exit_codes() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    queuectl(dir.path(), &["init"]);

    let enqueued = queuectl(
        dir.path(),
        &["enqueue", "--id", "job-1", "--command", "echo hi"],
    );
    assert!(enqueued.status.success());
    assert!(stdout(&enqueued).contains("job-1"));

    // Re-enqueue of the same id is an input error.
    let duplicate = queuectl(
        dir.path(),
        &["enqueue", "--id", "job-1", "--command", "echo again"],
    );
    assert_eq!(duplicate.status.code(), Some(1));

    // So is a blank command.
    let blank = queuectl(dir.path(), &["enqueue", "--id", "job-2", "--command", " "]);
    assert_eq!(blank.status.code(), Some(1));

    let listed = queuectl(dir.path(), &["list", "--state", "pending"]);
    assert!(listed.status.success());
    assert!(stdout(&listed).contains("job-1"));

    let none = queuectl(dir.path(), &["list", "--state", "completed"]);
    assert!(none.status.success());
    assert!(stdout(&none).contains("no jobs"));

    let bad_state = queuectl(dir.path(), &["list", "--state", "limbo"]);
    assert_eq!(bad_state.status.code(), Some(1));
}

#[test]
fn test_enqueue_accepts_a_json_spec() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    queuectl(dir.path(), &["init"]);

    let enqueued = queuectl(
        dir.path(),
        &[
            "enqueue",
            "--json",
            r#"{"id": "from-json", "command": "echo hi", "priority": 7, "timeout_seconds": 30}"#,
        ],
    );
    assert!(enqueued.status.success());

    let listed = queuectl(dir.path(), &["list"]);
    assert!(stdout(&listed).contains("from-json"));

    let garbage = queuectl(dir.path(), &["enqueue", "--json", "{not json"]);
    assert_eq!(garbage.status.code(), Some(1));
}

#[test]
fn test_config_set_get_round_trip() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    queuectl(dir.path(), &["init"]);

    // Defaults are visible before any set.
    let default = queuectl(dir.path(), &["config", "get", "max_retries"]);
    assert_eq!(stdout(&default).trim(), "3");

    assert!(queuectl(dir.path(), &["config", "set", "max_retries", "5"])
        .status
        .success());
    let updated = queuectl(dir.path(), &["config", "get", "max_retries"]);
    assert_eq!(stdout(&updated).trim(), "5");

    let unknown = queuectl(dir.path(), &["config", "get", "nonsense"]);
    assert_eq!(unknown.status.code(), Some(1));

    let invalid = queuectl(dir.path(), &["config", "set", "backoff_base", "zero"]);
    assert_eq!(invalid.status.code(), Some(1));
}

#[test]
fn test_state_violations_exit_with_three() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    queuectl(dir.path(), &["init"]);
    queuectl(
        dir.path(),
        &["enqueue", "--id", "job-1", "--command", "echo hi"],
    );

    // Retrying a job that is not dead is a state violation.
    let retry = queuectl(dir.path(), &["dlq", "retry", "job-1"]);
    assert_eq!(retry.status.code(), Some(3));

    // Stopping without a fleet is too.
    let stop = queuectl(dir.path(), &["worker", "stop"]);
    assert_eq!(stop.status.code(), Some(3));

    // An unknown id, by contrast, is an input error.
    let missing = queuectl(dir.path(), &["dlq", "retry", "who"]);
    assert_eq!(missing.status.code(), Some(1));
}

#[test]
fn test_status_reports_counts_and_fleet() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    queuectl(dir.path(), &["init"]);
    queuectl(
        dir.path(),
        &["enqueue", "--id", "job-1", "--command", "echo hi"],
    );

    let status = queuectl(dir.path(), &["status"]);
    assert!(status.status.success());
    let out = stdout(&status);
    assert!(out.contains("pending"));
    assert!(out.contains("workers: none"));
}

#[test]
fn test_logs_for_unknown_job_is_an_input_error() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    queuectl(dir.path(), &["init"]);

    let logs = queuectl(dir.path(), &["logs", "nope"]);
    assert_eq!(logs.status.code(), Some(1));
}
