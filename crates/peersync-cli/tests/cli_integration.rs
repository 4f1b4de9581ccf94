//! CLI Integration Tests
//!
//! These tests verify the CLI commands work correctly end-to-end.
//! They test the "wiring" between the CLI and the core library.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

/// Create a CLI command with a temporary data directory
fn cli_cmd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("peersync").expect("Failed to find peersync binary");
    cmd.env_remove("PEERSYNC_DATA_DIR")
        .env_remove("PEERSYNC_DEVICE_NAME")
        .arg("--data-dir")
        .arg(data_dir.path());
    cmd
}

/// Extract the site id from `info` output (format: "  Site ID: <hex>")
fn extract_site_id(output: &str) -> Option<String> {
    for line in output.lines() {
        if let Some(id) = line.strip_prefix("  Site ID: ") {
            return Some(id.trim().to_string());
        }
    }
    None
}

fn site_id(data_dir: &TempDir) -> String {
    let output = cli_cmd(data_dir).arg("info").output().unwrap();
    extract_site_id(&String::from_utf8_lossy(&output.stdout)).expect("no site id in output")
}

// ============================================================================
// Info and Name
// ============================================================================

#[test]
fn test_info_command() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("peersync"))
        .stdout(predicate::str::contains("Site ID:"))
        .stdout(predicate::str::contains("Known peers: 0"));
}

#[test]
fn test_site_id_is_stable() {
    let data_dir = TempDir::new().unwrap();

    let first = site_id(&data_dir);
    let second = site_id(&data_dir);
    assert_eq!(first.len(), 64);
    assert_eq!(first, second);
}

#[test]
fn test_set_device_name() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["name", "kitchen tablet"])
        .assert()
        .success();

    cli_cmd(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("Name: kitchen tablet"));
}

// ============================================================================
// Data Commands
// ============================================================================

#[test]
fn test_set_and_get() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["set", "workout", "w1", "title", "Leg day"])
        .assert()
        .success()
        .stdout(predicate::str::contains("db_version 1"));

    cli_cmd(&data_dir)
        .args(["set", "workout", "w1", "sets", "4"])
        .assert()
        .success();

    cli_cmd(&data_dir)
        .args(["get", "workout", "w1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("title = Leg day"))
        .stdout(predicate::str::contains("sets = 4"));

    cli_cmd(&data_dir)
        .args(["get", "workout"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 rows"));
}

#[test]
fn test_get_missing_row() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["get", "workout", "nope"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Row not found"));
}

#[test]
fn test_changes_since() {
    let data_dir = TempDir::new().unwrap();

    for reps in ["5", "8", "10"] {
        cli_cmd(&data_dir)
            .args(["set", "set", "s1", "reps", reps])
            .assert()
            .success();
    }

    cli_cmd(&data_dir)
        .args(["changes", "--since", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(2)"))
        .stdout(predicate::str::contains("= 10"))
        .stdout(predicate::str::contains("= 5").not());
}

#[test]
fn test_invalid_identifier_fails() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["set", "", "w1", "title", "x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid change"));
}

// ============================================================================
// Peer Commands
// ============================================================================

#[test]
fn test_peers_list_empty() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["peers", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No peers found"));
}

#[test]
fn test_peers_add_and_list() {
    let data_dir = TempDir::new().unwrap();
    let other_dir = TempDir::new().unwrap();
    let peer_id = site_id(&other_dir);

    cli_cmd(&data_dir)
        .args(["peers", "add", &peer_id, "--name", "laptop"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Peer added: laptop"));

    cli_cmd(&data_dir)
        .args(["peers", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("laptop"))
        .stdout(predicate::str::contains("Cursor: 0"));

    cli_cmd(&data_dir)
        .args(["peers", "list", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("\"id\": \"{}\"", peer_id)))
        .stdout(predicate::str::contains("\"version\": 0"));
}

#[test]
fn test_peers_add_rejects_self() {
    let data_dir = TempDir::new().unwrap();
    let own_id = site_id(&data_dir);

    cli_cmd(&data_dir)
        .args(["peers", "add", &own_id])
        .assert()
        .failure();
}

#[test]
fn test_peers_add_rejects_bad_id() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["peers", "add", "zz"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid site ID"));
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_config_file_is_loaded() {
    let data_dir = TempDir::new().unwrap();
    let config_path = data_dir.path().join("peersync.toml");
    std::fs::write(
        &config_path,
        "device_name = \"from-config\"\nheartbeat_interval = \"5s\"\n",
    )
    .unwrap();

    cli_cmd(&data_dir)
        .arg("--config")
        .arg(&config_path)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("Name: from-config"));
}

#[test]
fn test_invalid_config_fails() {
    let data_dir = TempDir::new().unwrap();
    let config_path = data_dir.path().join("peersync.toml");
    std::fs::write(&config_path, "heartbeat_interval = \"0s\"\n").unwrap();

    cli_cmd(&data_dir)
        .arg("--config")
        .arg(&config_path)
        .arg("info")
        .assert()
        .failure();
}

#[test]
fn test_config_init_round_trips() {
    let data_dir = TempDir::new().unwrap();
    let config_path = data_dir.path().join("written.toml");

    cli_cmd(&data_dir)
        .args(["config", "init"])
        .arg(&config_path)
        .assert()
        .success();

    let written = std::fs::read_to_string(&config_path).unwrap();
    assert!(written.contains("heartbeat_interval"));

    cli_cmd(&data_dir)
        .arg("--config")
        .arg(&config_path)
        .arg("info")
        .assert()
        .success();
}
