//! Integration tests for the kiln-agent command line
//!
//! These tests cover startup validation, which must fail fast with a
//! non-zero exit before any connection is attempted.

#![allow(deprecated)]

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn agent() -> Command {
    let mut cmd = Command::cargo_bin("kiln-agent").unwrap();
    cmd.env_clear();
    cmd
}

const REQUIRED: [&str; 10] = [
    "--remote-ref",
    "refs/heads/main",
    "--commit",
    "0123456789abcdef0123456789abcdef01234567",
    "--clone-url",
    "https://example.com/repo.git",
    "--image",
    "rust:1.80",
    "--image-url",
    "https://images.example.com/rust-1.80.tar",
];

/// Test that the help lists the main options
#[test]
fn test_help_shows_options() {
    agent()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("<URL>"))
        .stdout(predicate::str::contains("--remote-ref"))
        .stdout(predicate::str::contains("--cache-options"))
        .stdout(predicate::str::contains("--sandbox"))
        .stdout(predicate::str::contains("--foreground"));
}

/// Test that a missing controller URL is fatal
#[test]
fn test_missing_url_fails() {
    agent()
        .args(REQUIRED)
        .assert()
        .failure()
        .stderr(predicate::str::contains("<URL>"));
}

/// Test that unsupported URL schemes are rejected before connecting
#[test]
fn test_bad_url_scheme_fails() {
    agent()
        .arg("ftp://ci.example.com/agents/1")
        .args(REQUIRED)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid controller URL"));
}

/// Test that an unparsable cache options blob is rejected
#[test]
fn test_bad_cache_options_fail() {
    agent()
        .arg("https://ci.example.com/agents/1")
        .args(REQUIRED)
        .args(["--cache-options", "{not json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid cache options"));
}

/// Test that required inputs can come from the environment
#[test]
fn test_environment_fallback() {
    agent()
        .arg("ftp://ci.example.com/agents/1")
        .env("KILN_REMOTE_REF", "refs/heads/main")
        .env("KILN_COMMIT", "0123456789abcdef0123456789abcdef01234567")
        .env("KILN_CLONE_URL", "https://example.com/repo.git")
        .env("KILN_IMAGE_NAME", "rust:1.80")
        .env("KILN_IMAGE_URL", "https://images.example.com/rust-1.80.tar")
        .assert()
        .failure()
        // Got past argument parsing to URL validation
        .stderr(predicate::str::contains("invalid controller URL"));
}

/// Test that an unreachable controller is a startup failure
#[test]
fn test_unreachable_controller_fails() {
    let work = TempDir::new().unwrap();
    agent()
        .arg("http://127.0.0.1:9/agents/1")
        .args(REQUIRED)
        .arg("--foreground")
        .arg("--work-dir")
        .arg(work.path())
        .arg("--cache-dir")
        .arg(work.path().join("cache"))
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .failure()
        .stderr(predicate::str::contains("agent run failed"));
}
