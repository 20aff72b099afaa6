use assert_cmd::prelude::*;
use assert_fs::prelude::*;
use predicates::prelude::*;
use std::process::Command;

#[test]
fn help_describes_the_node_runner() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("meshkv")?;

    cmd.arg("--help");
    cmd.assert().success().stdout(predicate::str::contains("Node runner and interactive client for meshkv"));

    Ok(())
}

#[test]
fn rejects_an_unknown_flag() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("meshkv")?;

    cmd.arg("--this-flag-does-not-exist");
    cmd.assert().failure();

    Ok(())
}

#[test]
fn a_single_query_against_a_fresh_node_reports_a_miss() -> Result<(), Box<dyn std::error::Error>> {
    let dir = assert_fs::TempDir::new()?;
    let config_path = dir.child("node.toml");

    let mut cmd = Command::cargo_bin("meshkv")?;
    cmd.args([
        "--config",
        config_path.path().to_str().unwrap(),
        "--non-interactive",
        "--query",
        "GET does-not-exist",
    ]);
    cmd.assert().success().stdout(predicate::str::contains("N/A ~"));

    Ok(())
}
