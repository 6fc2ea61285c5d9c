//! Integration tests for core CLI contract behavior.

use predicates::prelude::*;
use std::fs;
use tempfile::tempdir;

fn cli_cmd() -> assert_cmd::Command {
    assert_cmd::Command::cargo_bin("millbridge").expect("binary built")
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("millbridge"))
        .stdout(predicate::str::contains("mock-server"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("millbridge"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn info_summarizes_builtin_catalog() {
    let mut cmd = cli_cmd();
    cmd.arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("Command Catalog"))
        .stdout(predicate::str::contains("Virtual Files"));
}

#[test]
fn info_json_writes_machine_output_to_stdout() {
    let mut cmd = cli_cmd();
    let output = cmd
        .args(["info", "--json"])
        .assert()
        .success()
        .get_output()
        .clone();

    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf-8");
    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("valid json expected");
    assert!(parsed.get("catalog").is_some());
    assert!(parsed.get("files").is_some());
}

#[test]
fn info_with_missing_catalog_fails() {
    let mut cmd = cli_cmd();
    cmd.args(["info", "--commands", "/tmp/not_exists_for_contract_test.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load catalog"));
}

#[test]
fn info_accepts_custom_catalog_and_files() {
    let dir = tempdir().expect("tempdir should be created");
    let commands = dir.path().join("commands.json");
    let files = dir.path().join("files.json");
    fs::write(
        &commands,
        r#"{"console_commands": {"version": {"response": "v1"}}}"#,
    )
    .expect("write commands.json");
    fs::write(&files, r#"[{"path": "/sd/x.nc", "contents": "G0\n"}]"#).expect("write files.json");

    let mut cmd = cli_cmd();
    cmd.arg("info")
        .arg("--commands")
        .arg(&commands)
        .arg("--files")
        .arg(&files)
        .assert()
        .success()
        .stdout(predicate::str::contains("/sd/x.nc"));
}

#[test]
fn completions_generate_for_bash() {
    let mut cmd = cli_cmd();
    cmd.args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("millbridge"));
}

#[test]
fn mock_server_rejects_invalid_catalog() {
    let dir = tempdir().expect("tempdir should be created");
    let commands = dir.path().join("bad.json");
    fs::write(&commands, "{ not json").expect("write bad.json");

    let mut cmd = cli_cmd();
    cmd.args(["mock-server", "--port", "0", "--commands"])
        .arg(&commands)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load catalog"));
}
