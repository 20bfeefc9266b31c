//! Integration tests for the `vault-init` binary.
//!
//! These exercise the CLI as a subprocess, verifying exit codes and error
//! output. They never need a running Vault server: configuration failures
//! are rejected before the network is touched, and the startup-failure test
//! points at a port nothing listens on.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::io::Write;
use std::path::Path;
use std::process::Command;

/// Locate the `vault-init` binary built by `cargo test`.
fn vault_init_bin() -> String {
    let path = env!("CARGO_BIN_EXE_vault-init");
    assert!(
        Path::new(path).exists(),
        "vault-init binary not found at {path}"
    );
    path.to_owned()
}

/// Run vault-init with args and a scrubbed environment; returns
/// (`exit_code`, stdout, stderr).
fn run(args: &[&str]) -> (i32, String, String) {
    let output = Command::new(vault_init_bin())
        .args(args)
        .env("VAULT_ADDR", "http://127.0.0.1:19999") // Nothing listens here.
        .env_remove("VAULT_TOKEN")
        .env_remove("VAULT_TOKEN_FILE")
        .env_remove("INIT_ACCESS_POLICIES")
        .env_remove("INIT_PATHS")
        .env_remove("INIT_TOKEN_TTL")
        .env_remove("INIT_TOKEN_PERIOD")
        .env_remove("INIT_ONE_SHOT")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to execute vault-init");

    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (code, stdout, stderr)
}

// ── Version & help ───────────────────────────────────────────────────

#[test]
fn version_flag_prints_a_semver() {
    let (code, stdout, _) = run(&["--version"]);
    assert_eq!(code, 0, "vault-init --version should exit 0");
    assert!(
        stdout.contains("vault-init 0.1.0"),
        "version output should contain the semver: {stdout}"
    );
}

#[test]
fn help_flag_documents_the_surface() {
    let (code, stdout, _) = run(&["--help"]);
    assert_eq!(code, 0, "vault-init --help should exit 0");
    assert!(stdout.contains("--access-policy"));
    assert!(stdout.contains("--one-shot"));
    assert!(stdout.contains("--vault-token-file"));
}

// ── Configuration validation ─────────────────────────────────────────

#[test]
fn missing_command_exits_with_config_error() {
    let (code, _, stderr) = run(&["--vault-token", "t"]);
    assert_eq!(code, 2, "missing command should be a config error: {stderr}");
    assert!(stderr.contains("no command specified"), "stderr: {stderr}");
}

#[test]
fn missing_token_exits_with_config_error() {
    let (code, _, stderr) = run(&["--", "/bin/true"]);
    assert_eq!(code, 2, "missing token should be a config error: {stderr}");
    assert!(stderr.contains("no Vault token available"), "stderr: {stderr}");
}

#[test]
fn ttl_and_period_conflict_exits_with_config_error() {
    let (code, _, stderr) = run(&[
        "--vault-token",
        "t",
        "--token-ttl",
        "1h",
        "--token-period",
        "30m",
        "--",
        "/bin/true",
    ]);
    assert_eq!(code, 2, "ttl/period conflict should be a config error: {stderr}");
    assert!(stderr.contains("mutually exclusive"), "stderr: {stderr}");
}

#[test]
fn unknown_log_format_is_rejected() {
    let (code, _, stderr) = run(&[
        "--vault-token",
        "t",
        "--log-format",
        "noop",
        "--",
        "/bin/true",
    ]);
    assert_ne!(code, 0);
    assert!(stderr.contains("unknown log format"), "stderr: {stderr}");
}

// ── Startup (non-config) failures ────────────────────────────────────

#[test]
fn unreachable_vault_is_a_startup_error_not_a_config_error() {
    let mut token_file = tempfile::NamedTempFile::new().unwrap();
    writeln!(token_file, "  s.filetoken  ").unwrap();

    let (code, _, stderr) = run(&[
        "--vault-token-file",
        &token_file.path().to_string_lossy(),
        "--",
        "/bin/true",
    ]);

    // The token file was accepted (config ok), then the health check
    // failed against the dead address.
    assert_eq!(code, 1, "unreachable vault should exit 1: {stderr}");
    assert!(
        stderr.contains("could not communicate with Vault"),
        "stderr: {stderr}"
    );
}
