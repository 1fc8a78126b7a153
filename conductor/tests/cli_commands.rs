//! CLI tests for the `conductor` binary.
//!
//! Spawns the binary and checks output and exit codes for the commands that
//! need no external collaborators.

use std::fs;
use std::process::Command;

use conductor::exit_codes;
use conductor::io::config::{DEFAULT_CONFIG_PATH, load_config};

fn conductor() -> Command {
    Command::new(env!("CARGO_BIN_EXE_conductor"))
}

#[test]
fn chains_lists_builtin_profiles() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = conductor()
        .current_dir(temp.path())
        .arg("chains")
        .output()
        .expect("conductor chains");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    for name in ["prototype", "minimal", "quality", "standard"] {
        assert!(stdout.contains(&format!("{name}: ")), "missing {name} in {stdout}");
    }
    assert!(stdout.contains("=fail=> Refactor"));
}

#[test]
fn chains_includes_custom_profiles() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = temp.path().join("conductor.toml");
    fs::write(
        &config,
        r#"
[chains.tiny]
entry = "Code"

[[chains.tiny.nodes]]
name = "Code"

[[chains.tiny.nodes]]
name = "Review"

[[chains.tiny.edges]]
from = "Code"
to = "Review"
"#,
    )
    .expect("write config");

    let output = conductor()
        .current_dir(temp.path())
        .args(["chains", "--config"])
        .arg(&config)
        .output()
        .expect("conductor chains");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&output.stdout).contains("tiny: Code -> Review"));
}

#[test]
fn invalid_chain_config_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = temp.path().join("conductor.toml");
    fs::write(
        &config,
        r#"
[chains.broken]
entry = "Code"

[[chains.broken.nodes]]
name = "Code"

[[chains.broken.edges]]
from = "Code"
to = "Ghost"
"#,
    )
    .expect("write config");

    let output = conductor()
        .current_dir(temp.path())
        .args(["run", "build", "it", "--chain", "broken", "--config"])
        .arg(&config)
        .output()
        .expect("conductor run");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Ghost"));
}

#[test]
fn unknown_chain_lists_available_profiles() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = conductor()
        .current_dir(temp.path())
        .args(["run", "build", "it", "--chain", "nope"])
        .output()
        .expect("conductor run");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown chain profile 'nope'"));
    assert!(stderr.contains("standard"));
}

#[test]
fn resolve_reports_selected_files() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("calc.py"), "").expect("write");
    fs::write(temp.path().join("test_calc.py"), "").expect("write");

    let output = conductor()
        .current_dir(temp.path())
        .arg("resolve")
        .output()
        .expect("conductor resolve");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("test_calc.py"));
    assert!(stdout.contains("discovered: 1 main, 1 test"));
}

#[test]
fn resolve_missing_directory_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = conductor()
        .current_dir(temp.path())
        .args(["resolve", "does-not-exist"])
        .output()
        .expect("conductor resolve");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stdout).contains("not found"));
}

#[test]
fn init_writes_loadable_default_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = conductor()
        .current_dir(temp.path())
        .arg("init")
        .status()
        .expect("conductor init");

    assert_eq!(status.code(), Some(exit_codes::OK));
    let config = load_config(&temp.path().join(DEFAULT_CONFIG_PATH)).expect("load");
    assert_eq!(config.default_chain, "standard");
}
