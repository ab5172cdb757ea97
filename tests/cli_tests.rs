//! Integration tests for the demo binary.
#![allow(deprecated)] // suppress assert_cmd::Command::cargo_bin deprecation in tests
#![cfg(target_os = "linux")]

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_describes_sampler() {
    let mut cmd = Command::cargo_bin("reloj").unwrap();
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Wall-clock sampling profiler"))
        .stdout(predicate::str::contains("--wall"))
        .stdout(predicate::str::contains("--event"));
}

#[test]
fn test_version_flag() {
    let mut cmd = Command::cargo_bin("reloj").unwrap();
    cmd.arg("--version");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("reloj"));
}

#[test]
fn test_short_run_prints_summary() {
    let mut cmd = Command::cargo_bin("reloj").unwrap();
    cmd.args([
        "--duration",
        "300",
        "--wall",
        "2000000",
        "--spinners",
        "1",
        "--sleepers",
        "1",
        "--filter-workload",
    ]);
    cmd.timeout(std::time::Duration::from_secs(30));
    cmd.assert().success().stderr(
        predicate::str::contains("samples total").or(predicate::str::contains("No samples")),
    );
}

#[test]
fn test_jsonl_output_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("samples.jsonl");

    let mut cmd = Command::cargo_bin("reloj").unwrap();
    cmd.args([
        "--duration",
        "300",
        "--wall",
        "2000000",
        "--spinners",
        "1",
        "--sleepers",
        "0",
        "--filter-workload",
        "--format",
        "jsonl",
        "--output",
    ]);
    cmd.arg(&path);
    cmd.timeout(std::time::Duration::from_secs(30));
    cmd.assert().success();

    let contents = std::fs::read_to_string(&path).unwrap();
    for line in contents.lines() {
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(value.get("tid").is_some());
        assert!(value.get("thread_state").is_some());
    }
}

#[test]
fn test_unknown_event_is_rejected() {
    let mut cmd = Command::cargo_bin("reloj").unwrap();
    cmd.args(["--event", "cache-misses", "--duration", "10"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration"));
}
