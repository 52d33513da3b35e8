//! End-to-end lifecycle through the CLI in direct mode.

mod common;

use common::{run_bd, BdWorkspace};
use predicates::prelude::*;
use serde_json::Value;

#[test]
fn version_flag_prints_package_version() {
    assert_cmd::Command::new(assert_cmd::cargo::cargo_bin!("bd"))
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn init_create_update_close() {
    let workspace = BdWorkspace::new();

    run_bd(&workspace, ["init", "--prefix", "proj"]).assert_success();
    assert!(workspace.beads_dir().join(".gitignore").exists());

    let create = run_bd(
        &workspace,
        ["create", "Fix login crash", "-p", "1", "-t", "bug", "-l", "auth"],
    );
    create.assert_success();
    assert!(create.stdout.contains("Created proj-1"), "{}", create.stdout);

    // counter-based minting continues
    run_bd(&workspace, ["create", "Second issue"]).assert_success();
    let show = run_bd(&workspace, ["--json", "show", "proj-2"]);
    show.assert_success();
    let issue: Value = serde_json::from_str(&show.stdout).unwrap();
    assert_eq!(issue["id"], "proj-2");

    run_bd(
        &workspace,
        ["update", "proj-1", "--status", "in_progress", "-a", "alice"],
    )
    .assert_success();

    let show = run_bd(&workspace, ["--json", "show", "proj-1"]);
    show.assert_success();
    let issue: Value = serde_json::from_str(&show.stdout).unwrap();
    assert_eq!(issue["status"], "in_progress");
    assert_eq!(issue["assignee"], "alice");
    assert_eq!(issue["labels"], serde_json::json!(["auth"]));

    let close = run_bd(&workspace, ["close", "proj-1", "-r", "fixed"]);
    close.assert_success();
    assert!(close.stdout.contains("Closed proj-1"));

    // closure invariant over the wire format
    let show = run_bd(&workspace, ["--json", "show", "proj-1"]);
    let issue: Value = serde_json::from_str(&show.stdout).unwrap();
    assert_eq!(issue["status"], "closed");
    assert!(issue.get("closed_at").is_some());

    // closing again is a note, not a failure
    let again = run_bd(&workspace, ["close", "proj-1"]);
    again.assert_success();
    assert!(again.stderr.contains("already closed"));
}

#[test]
fn mutations_auto_flush_to_jsonl() {
    let workspace = BdWorkspace::initialized();

    run_bd(&workspace, ["create", "Tracked in git"]).assert_success();

    let contents = std::fs::read_to_string(workspace.jsonl_path()).unwrap();
    assert!(contents.ends_with('\n'));
    assert!(contents.contains("\"id\":\"bd-1\""));
    assert!(contents.contains("Tracked in git"));
}

#[test]
fn list_filters_and_search() {
    let workspace = BdWorkspace::initialized();
    run_bd(&workspace, ["create", "Fix login", "-p", "0"]).assert_success();
    run_bd(&workspace, ["create", "Add dark mode", "-a", "bob"]).assert_success();
    run_bd(&workspace, ["close", "bd-2"]).assert_success();

    let open = run_bd(&workspace, ["--json", "list", "-s", "open"]);
    open.assert_success();
    let issues: Vec<Value> = serde_json::from_str(&open.stdout).unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0]["id"], "bd-1");

    let matched = run_bd(&workspace, ["--json", "list", "-q", "dark"]);
    matched.assert_success();
    let issues: Vec<Value> = serde_json::from_str(&matched.stdout).unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0]["id"], "bd-2");
}

#[test]
fn dep_cycle_rejected_with_hint() {
    let workspace = BdWorkspace::initialized();
    run_bd(&workspace, ["create", "one"]).assert_success();
    run_bd(&workspace, ["create", "two"]).assert_success();

    run_bd(&workspace, ["dep", "add", "bd-1", "bd-2"]).assert_success();
    let cycle = run_bd(&workspace, ["dep", "add", "bd-2", "bd-1"]);
    assert!(!cycle.status.success());
    assert!(cycle.stderr.contains("Cycle"), "{}", cycle.stderr);

    // informational edges may close loops
    run_bd(&workspace, ["dep", "add", "bd-2", "bd-1", "-t", "related"]).assert_success();
}

#[test]
fn label_set_semantics_via_cli() {
    let workspace = BdWorkspace::initialized();
    run_bd(&workspace, ["create", "labelled"]).assert_success();

    run_bd(&workspace, ["label", "add", "bd-1", "infra"]).assert_success();
    let duplicate = run_bd(&workspace, ["label", "add", "bd-1", "infra"]);
    duplicate.assert_success();
    assert!(duplicate.stdout.contains("already has"));

    run_bd(&workspace, ["label", "remove", "bd-1", "infra"]).assert_success();
    let absent = run_bd(&workspace, ["label", "remove", "bd-1", "infra"]);
    absent.assert_success();
    assert!(absent.stdout.contains("does not have"));
}

#[test]
fn validate_reports_clean_workspace() {
    let workspace = BdWorkspace::initialized();
    run_bd(&workspace, ["create", "healthy"]).assert_success();

    let validate = run_bd(&workspace, ["validate"]);
    validate.assert_success();
    assert!(validate.stdout.contains("orphaned-dependencies: ok"));
}

#[test]
fn uninitialized_workspace_errors_with_hint() {
    let workspace = BdWorkspace::new();
    let result = run_bd(&workspace, ["list"]);
    assert!(!result.status.success());
    assert!(result.stderr.contains("bd init"), "{}", result.stderr);
}
