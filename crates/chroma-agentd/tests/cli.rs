//! The `chroma-agent` binary's exit statuses and output.

use std::process::{Command, Output};

use serde_json::Value;

fn agent(state_dir: &std::path::Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_chroma-agent"))
        .arg("--state-dir")
        .arg(state_dir)
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .unwrap()
}

#[cfg(target_os = "linux")]
#[test]
fn daemon_without_configuration_exits_2() {
    let dir = tempfile::tempdir().unwrap();
    let out = agent(dir.path(), &["daemon"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).contains("not configured"));
}

#[test]
fn invoke_prints_the_result_body() {
    let dir = tempfile::tempdir().unwrap();
    let out = agent(dir.path(), &["invoke", "--action", "frobnicate", "--arg", "x=1"]);
    assert_eq!(out.status.code(), Some(1));

    let body: Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error_kind"], "ACTION_UNKNOWN");
}

#[test]
fn invoke_rejects_malformed_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let out = agent(dir.path(), &["invoke", "--action", "set_conf_param", "--arg", "oops"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(out.stdout.is_empty());
}
