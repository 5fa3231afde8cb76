//! CLI integration tests.
//!
//! Runs the built `datagate` binary against temporary SQLite databases.

mod common;

use std::path::Path;
use std::process::{Command, Output};

use common::TestFixture;

fn datagate(fixture: &TestFixture) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_datagate"));
    cmd.env_remove("DATAGATE_CATALOG")
        .env("DATAGATE_AUDIT_DB", &fixture.audit_db)
        .env("RUST_LOG", "error");
    cmd
}

fn write_config(fixture: &TestFixture) -> std::path::PathBuf {
    let path = fixture.temp_dir.path().join("users.json");
    let json = serde_json::json!({
        "kind": "sqlite",
        "path": fixture.app_db,
        "table_name": "users",
    });
    std::fs::write(&path, json.to_string()).unwrap();
    path
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn run(cmd: &mut Command, args: &[&str]) -> Output {
    cmd.args(args).output().expect("failed to run datagate")
}

fn arg(path: &Path) -> &str {
    path.to_str().expect("utf-8 path")
}

#[test]
fn test_cli_help_output() {
    let fixture = TestFixture::new();
    let output = run(&mut datagate(&fixture), &["--help"]);
    let help = stdout(&output);

    for expected in ["--audit-db", "--catalog", "--lock-ttl-secs", "probe", "read", "history"] {
        assert!(help.contains(expected), "help should mention {expected}: {help}");
    }
}

#[test]
fn test_cli_version_output() {
    let fixture = TestFixture::new();
    let output = run(&mut datagate(&fixture), &["--version"]);
    assert!(
        stdout(&output).contains(env!("CARGO_PKG_VERSION")),
        "version output should contain version number"
    );
}

#[test]
fn test_read_json_output() {
    let fixture = TestFixture::new();
    fixture
        .app_conn()
        .execute_batch("INSERT INTO users (id, name) VALUES (1, 'Alice'), (2, 'Bob'), (3, 'Carol');")
        .unwrap();
    let config = write_config(&fixture);

    let output = run(
        &mut datagate(&fixture),
        &[
            "--output",
            "json",
            "read",
            "--config",
            arg(&config),
            "--query",
            r#"{"order": [{"field": "id", "direction": "desc"}]}"#,
            "--limit",
            "2",
        ],
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let data: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(data["columns"], serde_json::json!(["id", "name"]));
    assert_eq!(data["rows"], serde_json::json!([[3, "Carol"], [2, "Bob"]]));
}

#[test]
fn test_read_rejects_bad_operator() {
    let fixture = TestFixture::new();
    let config = write_config(&fixture);

    let output = run(
        &mut datagate(&fixture),
        &[
            "read",
            "--config",
            arg(&config),
            "--query",
            r#"{"filter": {"field": "id", "op": "between", "value": 1}}"#,
        ],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("between"));
}

#[test]
fn test_probe_and_schema() {
    let fixture = TestFixture::new();
    let config = write_config(&fixture);

    let output = run(&mut datagate(&fixture), &["probe", "--config", arg(&config)]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("reachable"));

    let output = run(&mut datagate(&fixture), &["schema", "--config", arg(&config)]);
    assert!(output.status.success());
    let schema = stdout(&output);
    assert!(schema.contains("id") && schema.contains("name"));

    let missing = fixture.temp_dir.path().join("missing.json");
    std::fs::write(
        &missing,
        serde_json::json!({"kind": "sqlite", "path": "/nonexistent/app.db", "table_name": "users"})
            .to_string(),
    )
    .unwrap();
    let output = run(&mut datagate(&fixture), &["probe", "--config", arg(&missing)]);
    assert!(!output.status.success());
    assert!(stdout(&output).contains("unreachable"));
}

#[test]
fn test_history_empty() {
    let fixture = TestFixture::new();
    let output = run(&mut datagate(&fixture), &["history", "--table", "5"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout(&output).contains("No audit entries."));
}
