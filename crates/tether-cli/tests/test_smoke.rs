//! End-to-end smoke tests that invoke the `tether` binary.
//!
//! Uses `assert_cmd` with `TETHER_*` environment overrides pointing at a
//! temp directory for complete isolation from any real agent state.

use assert_cmd::Command;
use predicates::prelude::*;

fn tether(plugin_dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("tether").expect("tether binary");
    cmd.env("TETHER_REGION_ID", "cn-test100");
    cmd.env("TETHER_PLUGIN_DIR", plugin_dir);
    cmd
}

#[test]
fn help_lists_the_surface() {
    Command::cargo_bin("tether")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("daemon"))
        .stdout(predicate::str::contains("plugin"))
        .stdout(predicate::str::contains("session"));
}

#[test]
fn plugin_list_local_on_empty_registry_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    tether(&dir.path().join("plugins"))
        .args(["plugin", "list", "--local"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Name"));
}

#[test]
fn plugin_execute_missing_package_uses_the_taxonomy() {
    let dir = tempfile::tempdir().unwrap();
    tether(&dir.path().join("plugins"))
        .args(["plugin", "execute", "--file", "/no/such/package.zip"])
        .assert()
        .code(10)
        .stderr(predicate::str::contains("PACKAGE_NOT_FOUND"));
}

#[test]
fn plugin_remove_unknown_plugin_reports_not_found() {
    let dir = tempfile::tempdir().unwrap();
    tether(&dir.path().join("plugins"))
        .args(["plugin", "remove", "--name", "ghost"])
        .assert()
        .code(10)
        .stderr(predicate::str::contains("PACKAGE_NOT_FOUND"));
}

#[test]
fn plugin_status_on_empty_registry_prints_an_empty_list() {
    let dir = tempfile::tempdir().unwrap();
    tether(&dir.path().join("plugins"))
        .args(["plugin", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}
