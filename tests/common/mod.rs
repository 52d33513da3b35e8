//! Shared test harness: a throwaway workspace plus a `bd` runner.

#![allow(dead_code)]

use assert_cmd::Command;
use std::ffi::OsStr;
use std::path::PathBuf;
use tempfile::TempDir;

#[derive(Debug)]
pub struct BdRun {
    pub stdout: String,
    pub stderr: String,
    pub status: std::process::ExitStatus,
}

impl BdRun {
    pub fn assert_success(&self) -> &Self {
        assert!(
            self.status.success(),
            "command failed\nstdout:\n{}\nstderr:\n{}",
            self.stdout,
            self.stderr
        );
        self
    }
}

pub struct BdWorkspace {
    pub temp_dir: TempDir,
    pub root: PathBuf,
}

impl BdWorkspace {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("temp dir");
        let root = temp_dir.path().to_path_buf();
        Self { temp_dir, root }
    }

    /// Workspace with `bd init` already run (prefix `bd`).
    pub fn initialized() -> Self {
        let workspace = Self::new();
        run_bd(&workspace, ["init", "--prefix", "bd"]).assert_success();
        workspace
    }

    pub fn beads_dir(&self) -> PathBuf {
        self.root.join(".beads")
    }

    pub fn jsonl_path(&self) -> PathBuf {
        self.beads_dir().join("beads.jsonl")
    }
}

pub fn run_bd<I, S>(workspace: &BdWorkspace, args: I) -> BdRun
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run_bd_with_env(workspace, args, [("BEADS_NO_DAEMON", "1")])
}

pub fn run_bd_with_env<I, S, E, K, V>(workspace: &BdWorkspace, args: I, env_vars: E) -> BdRun
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
    E: IntoIterator<Item = (K, V)>,
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
{
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("bd"));
    cmd.current_dir(&workspace.root);
    cmd.args(args);
    cmd.envs(env_vars);
    cmd.env("NO_COLOR", "1");
    cmd.env("HOME", &workspace.root);
    cmd.env("RUST_BACKTRACE", "1");

    let output = cmd.output().expect("run bd");
    BdRun {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        status: output.status,
    }
}

/// Minimal JSONL record for seeding files in tests.
pub fn record_line(id: &str, title: &str) -> String {
    format!(
        r#"{{"id":"{id}","title":"{title}","status":"open","priority":2,"issue_type":"task","created_at":"2026-01-01T00:00:00Z","updated_at":"2026-01-01T00:00:00Z"}}"#
    )
}

/// Run git in the workspace, skipping the test when git is unavailable.
pub fn git(workspace: &BdWorkspace, args: &[&str]) -> bool {
    std::process::Command::new("git")
        .args(args)
        .current_dir(&workspace.root)
        .env("GIT_AUTHOR_NAME", "Test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "Test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
