//! Local git operations for the review pipeline.
//!
//! This module materialises the before/after states of the target
//! repository using only local fetches and worktree operations:
//! - Ref fetches into a dedicated `refs/nixpkgs-review/<n>` namespace
//! - Ephemeral worktree creation, reset and removal
//! - Merging the head under review inside a worktree
//! - Tree-snapshot commits for working-tree reviews
//!
//! All commands run with a clean git environment (no system/user config)
//! and a pinned committer identity, so behaviour does not depend on the
//! machine's git configuration. The outer checkout's index and working
//! tree are never touched.

pub mod fetch;
pub mod snapshot;
pub mod worktree;

pub use fetch::fetch_refs;
pub use snapshot::tree_snapshot;
pub use worktree::{Worktree, make_worktree};

use std::path::Path;
use std::process::{Command, Output, Stdio};

use thiserror::Error;

use crate::types::{InvalidSha, Sha};

/// Errors from git operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// Git command failed.
    #[error("git command failed: {command}\nstderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// Merge conflict; the worktree is left in the conflicted state for
    /// inspection.
    #[error("merge conflict merging {commit}: {details}")]
    MergeConflict { commit: String, details: String },

    /// Worktree operation failed.
    #[error("worktree error: {details}")]
    WorktreeError { details: String },

    /// Invalid SHA output from git.
    #[error("invalid SHA from git: {0}")]
    InvalidSha(#[from] InvalidSha),

    /// Failed to fetch a ref.
    #[error("failed to fetch ref {refspec}: {details}")]
    FetchFailed { refspec: String, details: String },

    /// The current directory is not inside a git repository.
    #[error("not inside a git repository: {details}")]
    NotARepository { details: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for git operations.
pub type GitResult<T> = Result<T, GitError>;

/// Create a git Command with a clean environment and pinned identity.
///
/// System and user git configuration are ignored so behaviour is
/// reproducible across machines (no rerere, hooks or aliases), and the
/// committer identity is fixed so snapshot/merge commits succeed without
/// per-repo configuration.
pub(crate) fn git_command(workdir: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.current_dir(workdir);
    cmd.env("GIT_CONFIG_NOSYSTEM", "1");
    cmd.env("GIT_CONFIG_GLOBAL", "/dev/null");
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.env("GIT_AUTHOR_NAME", "nixpkgs-review");
    cmd.env("GIT_AUTHOR_EMAIL", "nixpkgs-review@example.com");
    cmd.env("GIT_COMMITTER_NAME", "nixpkgs-review");
    cmd.env("GIT_COMMITTER_EMAIL", "nixpkgs-review@example.com");
    cmd
}

/// Run a git command in the given working directory, requiring exit 0.
pub fn run_git_sync(workdir: &Path, args: &[&str]) -> GitResult<Output> {
    let output = git_command(workdir)
        .args(args)
        .stdin(Stdio::null())
        .output()?;

    if output.status.success() {
        Ok(output)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let command = format!("git {}", args.join(" "));
        Err(GitError::CommandFailed { command, stderr })
    }
}

/// Run a git command and return trimmed stdout.
pub fn run_git_stdout(workdir: &Path, args: &[&str]) -> GitResult<String> {
    let output = run_git_sync(workdir, args)?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Resolve and verify a revision to a full commit SHA.
pub fn verify_commit(workdir: &Path, rev: &str) -> GitResult<Sha> {
    let sha_str = run_git_stdout(workdir, &["rev-parse", "--verify", rev])?;
    Ok(Sha::parse(&sha_str)?)
}

/// The merge base of two commits.
pub fn merge_base(workdir: &Path, a: &str, b: &str) -> GitResult<Sha> {
    let sha_str = run_git_stdout(workdir, &["merge-base", a, b])?;
    Ok(Sha::parse(&sha_str)?)
}

/// The current HEAD commit.
pub fn head_commit(workdir: &Path) -> GitResult<Sha> {
    verify_commit(workdir, "HEAD")
}

/// Whether the repository at `workdir` is a shallow clone.
pub fn is_shallow(workdir: &Path) -> GitResult<bool> {
    let out = run_git_stdout(workdir, &["rev-parse", "--is-shallow-repository"])?;
    Ok(out == "true")
}

/// The repository's git directory (handles worktree `.git` files too).
pub fn git_dir(workdir: &Path) -> GitResult<std::path::PathBuf> {
    let out = run_git_stdout(workdir, &["rev-parse", "--absolute-git-dir"]).map_err(|e| {
        GitError::NotARepository {
            details: e.to_string(),
        }
    })?;
    Ok(std::path::PathBuf::from(out))
}

/// The top level of the working tree containing `workdir`.
pub fn top_level(workdir: &Path) -> GitResult<std::path::PathBuf> {
    let out = run_git_stdout(workdir, &["rev-parse", "--show-toplevel"]).map_err(|e| {
        GitError::NotARepository {
            details: e.to_string(),
        }
    })?;
    Ok(std::path::PathBuf::from(out))
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn verify_commit_resolves_head() {
        let (_tmp, repo) = create_test_repo();
        let sha = verify_commit(&repo, "HEAD").unwrap();
        assert_eq!(sha.as_str().len(), 40);
    }

    #[test]
    fn verify_commit_rejects_unknown_rev() {
        let (_tmp, repo) = create_test_repo();
        assert!(verify_commit(&repo, "does-not-exist").is_err());
    }

    #[test]
    fn merge_base_of_linear_history_is_ancestor() {
        let (_tmp, repo) = create_test_repo();
        let first = head_commit(&repo).unwrap();
        let second = commit_file(&repo, "a.txt", "a", "second");
        let base = merge_base(&repo, first.as_str(), second.as_str()).unwrap();
        assert_eq!(base, first);
    }

    #[test]
    fn fresh_test_repo_is_not_shallow() {
        let (_tmp, repo) = create_test_repo();
        assert!(!is_shallow(&repo).unwrap());
    }

    #[test]
    fn git_dir_is_inside_repo() {
        let (_tmp, repo) = create_test_repo();
        let dir = git_dir(&repo).unwrap();
        assert!(dir.ends_with(".git"));
    }
}
