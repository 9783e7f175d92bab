use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::json;

mod helpers;
use helpers::{unique_test_temp_dir, write_script, FixtureServer};

fn run_iasd(args: &[&str]) -> std::process::Output {
    // This env var is provided by Cargo for integration tests.
    let exe = env!("CARGO_BIN_EXE_iasd");
    Command::new(exe)
        .args(args)
        .env_remove("IAS_JSONURL")
        .env_remove("IAS_DRY_RUN")
        .env_remove("RUST_LOG")
        .output()
        .expect("run iasd binary")
}

fn write_manifest(dir: &Path, doc: &serde_json::Value) -> PathBuf {
    let path = dir.join("bootstrap.json");
    fs::write(&path, serde_json::to_vec_pretty(doc).unwrap()).unwrap();
    path
}

fn write_config(dir: &Path, manifest_url: &str) -> PathBuf {
    let path = dir.join("ias.yaml");
    let yaml = format!(
        "JSONURL: \"{manifest_url}\"\nInstallPath: \"{}\"\nDaemonEndpoint: \"127.0.0.1:0\"\nMaximumRedownloads: 0\n",
        dir.join("install").display()
    );
    fs::write(&path, yaml).unwrap();
    path
}

#[test]
fn help_lists_subcommands() {
    let out = run_iasd(&["--help"]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    for cmd in ["run", "plan", "keygen", "sign", "verify"] {
        assert!(stdout.contains(cmd), "missing '{cmd}' in:\n{stdout}");
    }
}

#[test]
fn plan_prints_phases_and_groups() {
    let dir = unique_test_temp_dir("cli-plan");
    let manifest = write_manifest(
        &dir,
        &json!({
            "preflight": [{"name": "check", "file": "/tmp/check.sh", "type": "rootscript"}],
            "userland": [
                {"name": "a", "file": "/tmp/a.pkg", "type": "package", "parallel_group": "apps"},
                {"name": "b", "file": "/tmp/b.pkg", "type": "package", "parallel_group": "apps"}
            ]
        }),
    );

    let out = run_iasd(&["plan", manifest.to_str().unwrap()]);
    assert!(
        out.status.success(),
        "expected success, stderr:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Phase: preflight"), "{stdout}");
    assert!(stdout.contains("Phase: setupassistant"), "{stdout}");
    assert!(stdout.contains("parallel group 'apps':"), "{stdout}");
}

#[test]
fn plan_rejects_malformed_manifest() {
    let dir = unique_test_temp_dir("cli-plan-bad");
    let path = dir.join("broken.json");
    fs::write(&path, b"{ not json").unwrap();

    let out = run_iasd(&["plan", path.to_str().unwrap()]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("failed to load manifest"), "{stderr}");
}

#[test]
fn run_without_manifest_url_fails() {
    let dir = unique_test_temp_dir("cli-no-url");
    let config = dir.join("empty.yaml");
    fs::write(&config, "").unwrap();

    let out = run_iasd(&["--dry-run", "--config", config.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("JSONURL"), "{stderr}");
}

#[test]
fn dry_run_completes_without_side_effects() {
    let dir = unique_test_temp_dir("cli-dry");
    let marker = dir.join("ran");
    let script = write_script(&dir, "root.sh", &format!("touch {}", marker.display()));
    let manifest = serde_json::to_vec(&json!({
        "setupassistant": [{"name": "root", "file": script, "type": "rootscript"}]
    }))
    .unwrap();
    let server = FixtureServer::start(&[("/bootstrap.json", &manifest[..])]);
    let config = write_config(&dir, &server.url("/bootstrap.json"));

    let out = run_iasd(&["run", "--dry-run", "--config", config.to_str().unwrap()]);
    assert!(
        out.status.success(),
        "expected success, stderr:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert!(!marker.exists());
    assert!(dir.join("install/bootstrap.json").exists());
}

#[test]
fn aborted_run_exits_one() {
    let dir = unique_test_temp_dir("cli-abort");
    let manifest = serde_json::to_vec(&json!({
        "setupassistant": [{
            "name": "gone",
            "file": dir.join("install/gone.pkg"),
            "type": "package",
            "fail_policy": "failure_is_not_an_option"
        }]
    }))
    .unwrap();
    let server = FixtureServer::start(&[("/bootstrap.json", &manifest[..])]);
    let config = write_config(&dir, &server.url("/bootstrap.json"));

    let out = run_iasd(&["--dry-run", "--config", config.to_str().unwrap()]);
    assert_eq!(
        out.status.code(),
        Some(1),
        "stderr:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );
}
