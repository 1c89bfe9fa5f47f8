//! Stored connection management through the binary, no broker needed

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn conduit(store: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_conduit"))
        .arg("--store-dir")
        .arg(store)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run conduit")
}

#[test]
fn add_list_show_remove() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("store");
    let file = dir.path().join("mqtt.toml");
    fs::write(
        &file,
        r#"
name = "placeholder"
notes = "local mosquitto"

[conn]
kind = "mqtt"
address = "tcp://localhost:1883"
qos_level = 1
"#,
    )
    .unwrap();

    let added = conduit(&store, &["connections", "add", "broker", "--file", file.to_str().unwrap()]);
    assert!(added.status.success(), "{}", String::from_utf8_lossy(&added.stderr));

    let listed = conduit(&store, &["connections", "list"]);
    let stdout = String::from_utf8_lossy(&listed.stdout);
    assert!(stdout.contains("broker\tmqtt\tlocal mosquitto"), "{}", stdout);

    let shown = conduit(&store, &["connections", "show", "broker"]);
    let json: serde_json::Value = serde_json::from_slice(&shown.stdout).unwrap();
    assert_eq!(json["name"], "broker");
    assert_eq!(json["conn"]["kind"], "mqtt");
    assert_eq!(json["conn"]["qos_level"], 1);

    let removed = conduit(&store, &["connections", "remove", "broker"]);
    assert!(removed.status.success());

    let listed = conduit(&store, &["connections", "list"]);
    assert!(listed.stdout.is_empty());
}

#[test]
fn read_with_unknown_connection_fails_before_connecting() {
    let dir = tempfile::tempdir().unwrap();
    let output = conduit(dir.path(), &["read", "--connection", "nope", "--target", "orders"]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("No stored connection named 'nope'"));
}
