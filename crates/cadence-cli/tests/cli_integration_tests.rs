//! CLI integration tests for cadence
//!
//! Tests the cadence CLI commands end-to-end using assert_cmd. Every test
//! points the CLI at its own config file and database inside a temp dir.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;
use tempfile::TempDir;

struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    /// Temp dir with a config file whose database lives next to it
    fn new() -> Self {
        let sandbox = Self {
            dir: TempDir::new().unwrap(),
        };
        let db = sandbox.dir.path().join("cadence.db");
        sandbox
            .cmd()
            .args(["config", "set", "storage.database_path", db.to_str().unwrap()])
            .assert()
            .success();
        sandbox
    }

    fn config_path(&self) -> PathBuf {
        self.dir.path().join("config.toml")
    }

    #[allow(deprecated)]
    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("cadence").unwrap();
        cmd.env("CADENCE_CONFIG_DIR", self.dir.path());
        cmd.arg("--config").arg(self.config_path());
        cmd
    }
}

#[test]
fn test_help_lists_commands() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("simulate"))
        .stdout(predicate::str::contains("doctor"));
}

#[test]
fn test_config_set_and_get() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .args(["config", "set", "bandit.epsilon", "0.2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set bandit.epsilon = 0.2"));

    sandbox
        .cmd()
        .args(["config", "get", "bandit.epsilon"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0.2"));

    let contents = std::fs::read_to_string(sandbox.config_path()).unwrap();
    assert!(contents.contains("epsilon = 0.2"));
}

#[test]
fn test_config_set_rejects_invalid_value() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .args(["config", "set", "bandit.epsilon", "1.5"])
        .assert()
        .failure();

    sandbox
        .cmd()
        .args(["config", "get", "bandit.epsilon"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1"));
}

#[test]
fn test_config_list_and_path() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .args(["config", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("goal.mode = IMPACT"))
        .stdout(predicate::str::contains("scheduler.timeout_hours = 48"));

    sandbox
        .cmd()
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn test_mode_set_and_show() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .args(["mode", "set", "fame"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Goal mode set to FAME"));

    sandbox
        .cmd()
        .args(["mode", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("FAME"))
        .stdout(predicate::str::contains("fame=0.65"));
}

#[test]
fn test_unknown_mode_fails() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .args(["mode", "set", "VIRAL"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown goal mode"));
}

#[test]
fn test_live_toggle() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .args(["live", "on"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Live on"));

    sandbox
        .cmd()
        .args(["config", "get", "scheduler.live"])
        .assert()
        .success()
        .stdout(predicate::str::contains("true"));
}

#[test]
fn test_status_on_empty_database() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Decisions:   0"));

    sandbox
        .cmd()
        .args(["status", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"pending\": 0"));
}

#[test]
fn test_arms_and_log_on_empty_database() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .args(["arms", "top"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No arms stored yet."));

    sandbox
        .cmd()
        .args(["arms", "recommend"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No observations yet."));

    sandbox
        .cmd()
        .arg("log")
        .assert()
        .success()
        .stdout(predicate::str::contains("No decisions logged yet."));
}

#[test]
fn test_doctor_passes() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .arg("doctor")
        .assert()
        .success()
        .stdout(predicate::str::contains("[OK] Database"))
        .stdout(predicate::str::contains("All checks passed."));
}

#[test]
fn test_simulate_reports_json() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .args(["simulate", "--ticks", "30", "--seed", "3", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"dispatched\": 30"))
        .stdout(predicate::str::contains("\"mean_regret\""));
}
