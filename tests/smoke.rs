//! Smoke tests -- verify the binary runs and the operator commands work
//! against a scratch database.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn fleetmedic(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("fleetmedic").unwrap();
    cmd.env_remove("FLEETMEDIC_CONFIG")
        .env("RUST_LOG", "warn")
        .arg("--db")
        .arg(dir.path().join("fleetmedic.db"));
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("fleetmedic")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("remediate faults across a service fleet"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("fleetmedic")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("fleetmedic"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["run", "--help"],
        vec!["simulate", "--help"],
        vec!["incidents", "list", "--help"],
        vec!["incidents", "abandon", "--help"],
        vec!["audit", "tail", "--help"],
    ] {
        Command::cargo_bin("fleetmedic").unwrap().args(&args).assert().success();
    }
}

#[test]
fn test_incidents_list_on_empty_database() {
    let dir = TempDir::new().unwrap();
    fleetmedic(&dir)
        .args(["incidents", "list"])
        .assert()
        .success()
        .stdout(predicates::str::contains("No incidents found."));
}

#[test]
fn test_show_unknown_incident_fails() {
    let dir = TempDir::new().unwrap();
    fleetmedic(&dir)
        .args(["incidents", "show", "6f1c2a3e-0000-4000-8000-000000000000"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("not found"));
}

#[test]
fn test_audit_tail_on_empty_database() {
    let dir = TempDir::new().unwrap();
    fleetmedic(&dir)
        .args(["audit", "tail"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_simulate_without_faults() {
    let dir = TempDir::new().unwrap();
    fleetmedic(&dir)
        .args(["simulate", "--cycles", "2", "--faults", "0", "--seed", "7", "--json"])
        .assert()
        .success()
        .stdout(predicates::str::contains("\"ticks\": 2"))
        .stdout(predicates::str::contains("\"incidents\": []"));
}
