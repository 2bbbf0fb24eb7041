//! End-to-end tests of the courier-sync binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

const EVENTS: &str = r#"[
    {"id": "6c9d3c2e-4b53-4d8f-9c1e-1f1e1d1c1b1a", "envelope_type": "user.update",
     "payload": "e30=", "is_encrypted": false, "origin": "stream"},
    {"id": "6c9d3c2e-4b53-4d8f-9c1e-1f1e1d1c1b1b", "envelope_type": "conversation.otr-message-add",
     "payload": "aGk=", "is_encrypted": true, "origin": "push_channel", "sender": "bob:c2"}
]"#;

fn courier_sync(database: &Path) -> Command {
    let mut cmd = Command::cargo_bin("courier-sync").unwrap();
    cmd.arg("--database").arg(database);
    cmd
}

#[test]
fn status_of_empty_log() {
    let dir = tempfile::tempdir().unwrap();
    courier_sync(&dir.path().join("events.db"))
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Pending events:   0"))
        .stdout(predicate::str::contains("Nothing to replay."));
}

#[test]
fn append_then_peek_and_status() {
    let dir = tempfile::tempdir().unwrap();
    let database = dir.path().join("events.db");
    let file = dir.path().join("events.json");
    std::fs::write(&file, EVENTS).unwrap();

    courier_sync(&database)
        .arg("append")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("Appended 2 events (#1..#2)"));

    courier_sync(&database)
        .args(["peek", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"sender\":\"bob:c2\""))
        .stdout(predicate::str::contains("6c9d3c2e-4b53-4d8f-9c1e-1f1e1d1c1b1a"));

    // peek does not acknowledge
    courier_sync(&database)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Pending events:   2"));
}

#[test]
fn peek_respects_limit() {
    let dir = tempfile::tempdir().unwrap();
    let database = dir.path().join("events.db");
    let file = dir.path().join("events.json");
    std::fs::write(&file, EVENTS).unwrap();
    courier_sync(&database).arg("append").arg(&file).assert().success();

    courier_sync(&database)
        .args(["peek", "--limit", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("user.update"))
        .stdout(predicate::str::contains("otr-message-add").not());
}

#[test]
fn append_rejects_invalid_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("events.json");
    std::fs::write(&file, "not json").unwrap();

    courier_sync(&dir.path().join("events.db"))
        .arg("append")
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid event file"));
}

#[test]
fn missing_config_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("courier-sync")
        .unwrap()
        .args(["--config"])
        .arg(dir.path().join("missing.toml"))
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load configuration"));
}
