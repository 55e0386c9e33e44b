//! `linkstats validate` against config files on disk.

use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

fn validate(config: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_linkstats"))
        .arg("--quiet")
        .arg("--config")
        .arg(config)
        .arg("validate")
        .env_remove("RUST_LOG")
        .env_remove("OBJECT_STORAGE_BACKEND")
        .output()
        .unwrap()
}

#[test]
fn malformed_config_fails_validation() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("linkstats.toml");
    std::fs::write(&path, "[archive\nchunk_size = 0\n").unwrap();

    let output = validate(&path);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Config load failed"), "stderr: {stderr}");
}

#[test]
fn invalid_values_fail_validation() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("linkstats.toml");
    std::fs::write(&path, "[archive]\nchunk_size = 0\n").unwrap();

    assert!(!validate(&path).status.success());
}

#[test]
fn missing_config_validates_with_defaults() {
    let tmp = TempDir::new().unwrap();

    assert!(validate(&tmp.path().join("missing.toml")).status.success());
}

#[test]
fn well_formed_config_validates() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("linkstats.toml");
    std::fs::write(
        &path,
        "[archive]\nchunk_size = 500\ncontainer = \"archive-linkevents\"\n\n[logging]\nlevel = \"warn\"\n",
    )
    .unwrap();

    assert!(validate(&path).status.success());
}
