#![cfg(feature = "storage-rocksdb")]

use assert_cmd::cargo_bin;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

fn run(db_path: &Path, args: &[&str]) -> Output {
    let mut cmd = Command::new(cargo_bin!("durable-charge"));
    cmd.arg("--db-path")
        .arg(db_path)
        .args(["--gateway-latency", "0s"])
        .args(args);
    cmd.output().expect("Failed to execute command")
}

const SUBMIT: &[&str] = &[
    "submit",
    "--customer-id",
    "customer-123",
    "--amount",
    "99.99",
    "--wait-seconds",
    "0",
    "--orchestration-id",
    "charge-workflow-fixed",
];

#[test]
fn test_rocksdb_persistence_recovery() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");

    // 1. First process charges.
    let output1 = run(&db_path, SUBMIT);
    assert!(output1.status.success());
    let stdout1 = String::from_utf8_lossy(&output1.stdout);
    assert!(stdout1.contains(
        "charge-workflow-fixed,Completed,true,false,customer-123:99.99:charge-workflow-fixed,,"
    ));

    // 2. Second process reuses the orchestration id and sees the stored charge.
    let output2 = run(&db_path, SUBMIT);
    assert!(output2.status.success());
    let stdout2 = String::from_utf8_lossy(&output2.stdout);
    assert!(stdout2.contains(
        "charge-workflow-fixed,Completed,false,true,customer-123:99.99:charge-workflow-fixed,,"
    ));

    // 3. Exactly one record survived both processes.
    let output3 = run(&db_path, &["charges"]);
    assert!(output3.status.success());
    let stdout3 = String::from_utf8_lossy(&output3.stdout);
    assert_eq!(
        stdout3
            .lines()
            .filter(|line| line.starts_with("customer-123:99.99:charge-workflow-fixed,"))
            .count(),
        1
    );

    // 4. The second run is visible through status.
    let output4 = run(&db_path, &["status", "charge-workflow-fixed"]);
    assert!(output4.status.success());
    let status: serde_json::Value = serde_json::from_slice(&output4.stdout).unwrap();
    assert_eq!(status["run"], 2);
    assert_eq!(status["status"], "Completed");
}

#[test]
fn test_rocksdb_resume_with_nothing_pending() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");

    assert!(run(&db_path, SUBMIT).status.success());

    let output = run(&db_path, &["resume"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("charge-workflow-fixed"));
}
