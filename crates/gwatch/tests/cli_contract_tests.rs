//! CLI contract tests for `gw`.
//!
//! Runs the binary as a subprocess against temp config files and checks
//! exit codes and output.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn gw() -> Command {
    let mut cmd = Command::cargo_bin("gw").expect("gw binary");
    for name in [
        "GW_CONFIG",
        "GW_SCHEDULER_IPV4",
        "GW_SCHEDULER_SERVE_WS_PORT",
        "GW_LOG_PATH",
        "RUST_LOG",
    ] {
        cmd.env_remove(name);
    }
    cmd
}

fn write_config(dir: &TempDir, body: &str) -> String {
    let path = dir.path().join("gwatch.toml");
    std::fs::write(&path, body).expect("write config");
    path.to_string_lossy().to_string()
}

#[test]
fn config_prints_defaults_as_toml() {
    gw().arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[scheduler]"))
        .stdout(predicate::str::contains("port = 10322"))
        .stdout(predicate::str::contains("trace_queue_capacity = 8192"));
}

#[test]
fn config_file_and_env_overrides_apply() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_config(&dir, "[capsule]\nscheduler_ip = \"10.1.2.3\"\n");
    gw().args(["--config", &path, "config"])
        .env("GW_SCHEDULER_SERVE_WS_PORT", "4000")
        .assert()
        .success()
        .stdout(predicate::str::contains("scheduler_ip = \"10.1.2.3\""))
        .stdout(predicate::str::contains("port = 4000"));
}

#[test]
fn config_path_reports_source() {
    gw().args(["config", "--path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("built-in defaults"));

    let dir = TempDir::new().expect("temp dir");
    let path = write_config(&dir, "");
    gw().args(["config", "--path"])
        .env("GW_CONFIG", &path)
        .assert()
        .success()
        .stdout(predicate::str::contains("gwatch.toml"));
}

#[test]
fn missing_config_file_fails() {
    gw().args(["--config", "/nonexistent/gwatch.toml", "config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn invalid_env_port_fails() {
    gw().arg("config")
        .env("GW_SCHEDULER_SERVE_WS_PORT", "not-a-port")
        .assert()
        .failure()
        .stderr(predicate::str::contains("GW_SCHEDULER_SERVE_WS_PORT"));
}

#[test]
fn invalid_config_value_fails_validation() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_config(&dir, "[transport]\nchunk_size = 0\n");
    gw().args(["--config", &path, "config"]).assert().failure();
}

#[test]
fn unknown_log_format_is_rejected() {
    gw().args(["--log-format", "xml", "config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("xml"));
}

#[test]
fn capsule_demo_without_scheduler_is_not_ready() {
    let dir = TempDir::new().expect("temp dir");
    let log_dir = dir.path().join("logs");
    let path = write_config(
        &dir,
        &format!(
            concat!(
                "[general]\nlog_dir = \"{}\"\n\n",
                "[capsule]\nconnect_timeout_ms = 200\nheartbeat_interval_ms = 0\n",
            ),
            log_dir.display()
        ),
    );
    gw().args(["--config", &path, "--log-level", "error", "capsule-demo"])
        .args(["--scheduler", "127.0.0.1:1", "--events", "1"])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .failure()
        .stderr(predicate::str::contains("not ready"));
}
