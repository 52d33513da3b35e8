//! Git subprocess wrappers.
//!
//! Version control is a capability, not a dependency: every caller treats
//! "no git" (binary missing, not a repository) as a soft condition and
//! carries on. The daemon's sync cycle uses the async variants so each call
//! is bounded by the cycle deadline.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use thiserror::Error;

/// Errors from running git commands.
#[derive(Debug, Error)]
pub enum GitError {
    /// The git binary could not be found or spawned.
    #[error("failed to execute git: {0}")]
    Spawn(#[from] std::io::Error),

    /// The git command exited with a non-zero status.
    #[error("git {command} failed (exit code {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The command outlived its deadline.
    #[error("git {command} timed out")]
    Timeout { command: String },
}

impl From<GitError> for crate::error::BeadsError {
    fn from(e: GitError) -> Self {
        Self::Other(anyhow::Error::new(e))
    }
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Run a git command, returning trimmed stdout.
pub fn git_command(args: &[&str], cwd: &Path) -> Result<String> {
    let output = Command::new("git").args(args).current_dir(cwd).output()?;
    if !output.status.success() {
        return Err(GitError::CommandFailed {
            command: args.join(" "),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Async variant bounded by a deadline, for the daemon's sync cycle.
pub async fn git_command_async(args: &[&str], cwd: &Path, deadline: Duration) -> Result<String> {
    let command = args.join(" ");
    let mut cmd = tokio::process::Command::new("git");
    cmd.args(args).current_dir(cwd).kill_on_drop(true);

    let output = tokio::time::timeout(deadline, cmd.output())
        .await
        .map_err(|_| GitError::Timeout {
            command: command.clone(),
        })??;

    if !output.status.success() {
        return Err(GitError::CommandFailed {
            command,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Whether `cwd` sits inside a git work tree.
#[must_use]
pub fn in_work_tree(cwd: &Path) -> bool {
    git_command(&["rev-parse", "--is-inside-work-tree"], cwd)
        .map(|out| out == "true")
        .unwrap_or(false)
}

/// Current HEAD commit, when resolvable.
#[must_use]
pub fn head_commit(cwd: &Path) -> Option<String> {
    git_command(&["rev-parse", "HEAD"], cwd).ok()
}

/// Repository root containing `cwd`, when inside a repository.
#[must_use]
pub fn repo_root(cwd: &Path) -> Option<PathBuf> {
    git_command(&["rev-parse", "--show-toplevel"], cwd)
        .ok()
        .map(PathBuf::from)
}

/// Read a blob from HEAD, e.g. `show_head_file(root, ".beads/beads.jsonl")`.
///
/// Returns `Ok(None)` when the path does not exist at HEAD; the caller
/// falls through to the next source.
pub fn show_head_file(repo_root: &Path, relpath: &str) -> Result<Option<String>> {
    match git_command(&["show", &format!("HEAD:{relpath}")], repo_root) {
        Ok(contents) => Ok(Some(contents)),
        Err(GitError::CommandFailed { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// The `refs/heads` directory of the repository containing `cwd`, used by
/// the watcher to notice branch movement after fetches and pulls.
#[must_use]
pub fn refs_heads_dir(cwd: &Path) -> Option<PathBuf> {
    let git_dir = git_command(&["rev-parse", "--git-dir"], cwd).ok()?;
    let git_dir = PathBuf::from(git_dir);
    let git_dir = if git_dir.is_absolute() {
        git_dir
    } else {
        cwd.join(git_dir)
    };
    let refs = git_dir.join("refs/heads");
    refs.is_dir().then_some(refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn init_repo(dir: &Path) -> bool {
        Command::new("git")
            .args(["init", "-q"])
            .current_dir(dir)
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[test]
    fn git_version_runs() {
        if git_command(&["--version"], Path::new(".")).is_err() {
            return; // no git on this machine; nothing to assert
        }
        let out = git_command(&["--version"], Path::new(".")).unwrap();
        assert!(out.starts_with("git version"));
    }

    #[test]
    fn bad_subcommand_fails_with_stderr() {
        if git_command(&["--version"], Path::new(".")).is_err() {
            return;
        }
        let err = git_command(&["definitely-not-a-subcommand"], Path::new(".")).unwrap_err();
        match err {
            GitError::CommandFailed { code, .. } => assert!(code.is_some()),
            other => panic!("expected CommandFailed, got: {other:?}"),
        }
    }

    #[test]
    fn work_tree_detection() {
        let temp = TempDir::new().unwrap();
        if !init_repo(temp.path()) {
            return;
        }
        assert!(in_work_tree(temp.path()));

        let outside = TempDir::new().unwrap();
        assert!(!in_work_tree(outside.path()));
    }

    #[test]
    fn show_head_file_absent_is_none() {
        let temp = TempDir::new().unwrap();
        if !init_repo(temp.path()) {
            return;
        }
        // fresh repo has no HEAD yet; either way this must not be a hard error
        let result = show_head_file(temp.path(), ".beads/beads.jsonl");
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn async_variant_honors_deadline() {
        if git_command(&["--version"], Path::new(".")).is_err() {
            return;
        }
        let out = git_command_async(&["--version"], Path::new("."), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(out.starts_with("git version"));
    }
}
