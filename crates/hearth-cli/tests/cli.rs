//! Command-line tests for the hearth binary.

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn hearth() -> Command {
    let mut cmd = Command::cargo_bin("hearth").unwrap();
    cmd.env_remove("HEARTH_PLUGIN_DIRS").env_remove("RUST_LOG");
    cmd
}

fn write_plugin(root: &Path, dir: &str, body: &str) {
    let dir = root.join(dir);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("plugin.json"), body).unwrap();
}

fn manifest(id: &str, plugin_type: &str) -> String {
    format!(
        r#"{{
            "id": "{id}",
            "name": "{id}",
            "version": "1.0.0",
            "author": "tests",
            "description": "cli test plugin",
            "plugin_type": "{plugin_type}",
            "main_class": "Noop",
            "api_version": "1.0",
            "permissions": ["devices.read"],
            "hooks": ["device.reading_updated"]
        }}"#
    )
}

#[test]
fn test_cli_help() {
    hearth()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("manifest"))
        .stdout(predicate::str::contains("plugin"))
        .stdout(predicate::str::contains("store"));
}

#[test]
fn test_cli_version() {
    hearth()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("hearth"));
}

#[test]
fn test_validate_good_manifest() {
    let tmp = TempDir::new().unwrap();
    write_plugin(tmp.path(), "meter", &manifest("meter", "device"));

    hearth()
        .args(["manifest", "validate"])
        .arg(tmp.path().join("meter"))
        .assert()
        .success()
        .stdout(predicate::str::contains("valid: meter 1.0.0 (device)"))
        .stdout(predicate::str::contains("devices.read"));
}

#[test]
fn test_validate_bad_manifest_fails() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("plugin.json");
    fs::write(&file, r#"{"id": "Bad Id", "name": "x"}"#).unwrap();

    hearth()
        .args(["manifest", "validate"])
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("version"));

    fs::write(&file, "{ not json").unwrap();
    hearth()
        .args(["manifest", "validate"])
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid JSON"));
}

#[test]
fn test_plugin_list_with_type_filter() {
    let tmp = TempDir::new().unwrap();
    write_plugin(tmp.path(), "meter", &manifest("meter", "device"));
    write_plugin(tmp.path(), "report", &manifest("report", "analytics"));
    write_plugin(tmp.path(), "broken", "{}");

    hearth()
        .args(["plugin", "list", "--dir"])
        .arg(tmp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("meter"))
        .stdout(predicate::str::contains("report"))
        .stdout(predicate::str::contains("Rejected"));

    hearth()
        .args(["plugin", "list", "--ty", "analytics", "--json", "--dir"])
        .arg(tmp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"id\": \"report\""))
        .stdout(predicate::str::contains("\"id\": \"meter\"").not());
}

#[test]
fn test_plugin_list_unknown_type() {
    let tmp = TempDir::new().unwrap();
    hearth()
        .args(["plugin", "list", "--ty", "gadget", "--dir"])
        .arg(tmp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown plugin type"));
}

#[test]
fn test_store_sync_then_inspect() {
    let tmp = TempDir::new().unwrap();
    let plugins = tmp.path().join("plugins");
    write_plugin(&plugins, "meter", &manifest("meter", "device"));
    let store = tmp.path().join("state").join("hearth.redb");

    hearth()
        .args(["store", "sync"])
        .arg(&store)
        .arg("--dir")
        .arg(&plugins)
        .assert()
        .success()
        .stdout(predicate::str::contains("registered: meter"));

    hearth()
        .args(["store", "inspect"])
        .arg(&store)
        .assert()
        .success()
        .stdout(predicate::str::contains("records: 1"))
        .stdout(predicate::str::contains("meter"))
        .stdout(predicate::str::contains("enabled"));
}

#[test]
fn test_store_inspect_missing_file() {
    let tmp = TempDir::new().unwrap();
    hearth()
        .args(["store", "inspect"])
        .arg(tmp.path().join("absent.redb"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Store not found"));
}

#[test]
fn test_config_show_reads_file() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("hearth.toml");
    fs::write(&file, "init_timeout_ms = 1234\n").unwrap();

    hearth()
        .arg("--config")
        .arg(&file)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("1234"));
}
