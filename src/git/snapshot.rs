//! Tree-snapshot commits for working-tree reviews.
//!
//! `wip` mode reviews uncommitted changes. Instead of applying diffs to
//! the review worktree, the working state is captured as a real commit
//! built against a temporary index file, so the outer checkout's index
//! and working tree are never modified.

use std::path::Path;

use tempfile::NamedTempFile;

use crate::types::Sha;

use super::{GitResult, git_command, git_dir, head_commit, run_git_stdout};

/// Commit a snapshot of the current state on top of HEAD.
///
/// With `staged` the snapshot contains exactly the index; otherwise it
/// contains the index plus all tracked working-tree modifications. The
/// commit is created with `commit-tree` and referenced by nothing, so it
/// is invisible to the user's branches.
///
/// Returns `None` when the snapshot tree is identical to HEAD's tree
/// (no diff to review).
pub fn tree_snapshot(workdir: &Path, staged: bool) -> GitResult<Option<Sha>> {
    let head = head_commit(workdir)?;

    // Work on a copy of the index so `git add` stays invisible.
    let scratch_index = NamedTempFile::new_in(git_dir(workdir)?)?;
    let index_path = scratch_index.path().to_path_buf();
    std::fs::copy(git_dir(workdir)?.join("index"), &index_path)?;
    let index_env = index_path.to_string_lossy().to_string();

    if !staged {
        let output = git_command(workdir)
            .env("GIT_INDEX_FILE", &index_env)
            .args(["add", "--update"])
            .output()?;
        if !output.status.success() {
            return Err(super::GitError::CommandFailed {
                command: "git add --update".into(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
    }

    let tree = {
        let output = git_command(workdir)
            .env("GIT_INDEX_FILE", &index_env)
            .args(["write-tree"])
            .output()?;
        if !output.status.success() {
            return Err(super::GitError::CommandFailed {
                command: "git write-tree".into(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    };

    let head_tree = run_git_stdout(workdir, &["rev-parse", "HEAD^{tree}"])?;
    if tree == head_tree {
        return Ok(None);
    }

    let commit = run_git_stdout(
        workdir,
        &[
            "commit-tree",
            &tree,
            "-p",
            head.as_str(),
            "-m",
            "nixpkgs-review working tree snapshot",
        ],
    )?;
    Ok(Some(Sha::parse(&commit)?))
}
