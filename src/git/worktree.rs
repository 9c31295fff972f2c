//! Ephemeral worktree management.
//!
//! Each review materialises the tree under inspection in its own worktree
//! in detached HEAD mode, leaving the primary checkout untouched. Creation
//! is idempotent: an existing worktree already at the requested commit is
//! reused, one at a different commit is reset.

use std::path::{Path, PathBuf};

use crate::types::Sha;

use super::{GitError, GitResult, git_command, run_git_stdout, run_git_sync, verify_commit};

/// A worktree created by this run.
///
/// Dropping the value does nothing; the orchestrator decides whether to
/// [`Worktree::remove`] it (normal exit) or preserve it for post-mortem
/// inspection (failure).
#[derive(Debug, Clone)]
pub struct Worktree {
    path: PathBuf,
    /// The repository the worktree was created from.
    source: PathBuf,
}

impl Worktree {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The commit currently checked out.
    pub fn head(&self) -> GitResult<Sha> {
        verify_commit(&self.path, "HEAD")
    }

    /// Merge `commit` into the current HEAD with `merge --no-edit`.
    ///
    /// On conflict the worktree is left in the conflicted state and
    /// `MergeConflict` is returned so the caller can preserve it.
    pub fn merge(&self, commit: &Sha) -> GitResult<Sha> {
        let output = git_command(&self.path)
            .args(["merge", "--no-edit", commit.as_str()])
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let conflicted = run_git_stdout(
                &self.path,
                &["diff", "--name-only", "--diff-filter=U"],
            )
            .unwrap_or_default();
            if !conflicted.is_empty() {
                return Err(GitError::MergeConflict {
                    commit: commit.to_string(),
                    details: conflicted.split('\n').collect::<Vec<_>>().join(", "),
                });
            }
            return Err(GitError::CommandFailed {
                command: format!("git merge --no-edit {commit}"),
                stderr: format!("{stderr}{stdout}"),
            });
        }
        self.head()
    }

    /// Check out `commit` in detached HEAD mode.
    pub fn checkout(&self, commit: &Sha) -> GitResult<()> {
        run_git_sync(&self.path, &["checkout", "--detach", commit.as_str()])?;
        Ok(())
    }

    /// Remove the worktree with `worktree remove --force`.
    ///
    /// Idempotent: removing a worktree that is already gone succeeds. The
    /// source checkout's index and working tree are never touched.
    pub fn remove(&self) -> GitResult<()> {
        if !self.path.exists() {
            return Ok(());
        }
        run_git_sync(
            &self.source,
            &[
                "worktree",
                "remove",
                "--force",
                self.path.to_str().ok_or_else(|| GitError::WorktreeError {
                    details: format!("non-UTF8 worktree path: {}", self.path.display()),
                })?,
            ],
        )
        .map_err(|e| GitError::WorktreeError {
            details: e.to_string(),
        })?;
        Ok(())
    }
}

/// Get or create a worktree for `sha` at `path`.
///
/// Idempotent: if `path` already is a worktree at `sha` it is reused; if
/// it points at a different commit it is reset to `sha`. After a
/// successful return the worktree's HEAD equals `sha` and its index is
/// clean.
pub fn make_worktree(source: &Path, path: &Path, sha: &Sha) -> GitResult<Worktree> {
    let worktree = Worktree {
        path: path.to_path_buf(),
        source: source.to_path_buf(),
    };

    if path.join(".git").exists() {
        // reset --hard moves a detached HEAD and clears any leftover
        // merge state, covering both the reuse and the reset case.
        run_git_sync(path, &["reset", "--hard", sha.as_str()])?;
        return Ok(worktree);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    run_git_sync(
        source,
        &[
            "worktree",
            "add",
            "--detach",
            path.to_str().ok_or_else(|| GitError::WorktreeError {
                details: format!("non-UTF8 worktree path: {}", path.display()),
            })?,
            sha.as_str(),
        ],
    )
    .map_err(|e| GitError::WorktreeError {
        details: e.to_string(),
    })?;
    Ok(worktree)
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::head_commit;
    use super::*;

    #[test]
    fn make_worktree_checks_out_requested_commit() {
        let (tmp, repo) = create_test_repo();
        let sha = head_commit(&repo).unwrap();
        let wt_path = tmp.path().join("wt");

        let wt = make_worktree(&repo, &wt_path, &sha).unwrap();
        assert_eq!(wt.head().unwrap(), sha);

        // Detached HEAD, clean index.
        let head = run_git_stdout(&wt_path, &["rev-parse", "--abbrev-ref", "HEAD"]).unwrap();
        assert_eq!(head, "HEAD");
        let status = run_git_stdout(&wt_path, &["status", "--porcelain"]).unwrap();
        assert!(status.is_empty());
    }

    #[test]
    fn make_worktree_is_idempotent() {
        let (tmp, repo) = create_test_repo();
        let sha = head_commit(&repo).unwrap();
        let wt_path = tmp.path().join("wt");

        let wt1 = make_worktree(&repo, &wt_path, &sha).unwrap();
        let wt2 = make_worktree(&repo, &wt_path, &sha).unwrap();
        assert_eq!(wt1.path(), wt2.path());
        assert_eq!(wt2.head().unwrap(), sha);
    }

    #[test]
    fn make_worktree_resets_existing_to_new_sha() {
        let (tmp, repo) = create_test_repo();
        let first = head_commit(&repo).unwrap();
        let wt_path = tmp.path().join("wt");
        make_worktree(&repo, &wt_path, &first).unwrap();

        let second = commit_file(&repo, "a.txt", "a", "second");
        let wt = make_worktree(&repo, &wt_path, &second).unwrap();
        assert_eq!(wt.head().unwrap(), second);
    }

    #[test]
    fn remove_is_idempotent() {
        let (tmp, repo) = create_test_repo();
        let sha = head_commit(&repo).unwrap();
        let wt_path = tmp.path().join("wt");
        let wt = make_worktree(&repo, &wt_path, &sha).unwrap();

        wt.remove().unwrap();
        assert!(!wt_path.exists());
        wt.remove().unwrap();
    }

    #[test]
    fn merge_fast_forward_succeeds() {
        let (tmp, repo) = create_test_repo();
        let base = head_commit(&repo).unwrap();
        let head = commit_file(&repo, "a.txt", "a", "feature");

        let wt_path = tmp.path().join("wt");
        let wt = make_worktree(&repo, &wt_path, &base).unwrap();
        let merged = wt.merge(&head).unwrap();
        assert_eq!(merged, head);
        assert!(wt_path.join("a.txt").exists());
    }

    #[test]
    fn merge_conflict_is_reported_and_worktree_preserved() {
        let (tmp, repo) = create_test_repo();
        let base = head_commit(&repo).unwrap();

        // Two commits touching the same lines of the same file.
        let ours = commit_file(&repo, "README.md", "ours", "ours");
        run_git_sync(&repo, &["checkout", "--detach", base.as_str()]).unwrap();
        run_git_sync(&repo, &["checkout", "-b", "theirs"]).unwrap();
        commit_file(&repo, "README.md", "theirs", "theirs");

        let wt_path = tmp.path().join("wt");
        let wt = make_worktree(&repo, &wt_path, &ours).unwrap();
        let theirs = verify_commit(&repo, "theirs").unwrap();
        let err = wt.merge(&theirs).unwrap_err();
        assert!(matches!(err, GitError::MergeConflict { .. }));
        assert!(wt_path.exists());
    }

    #[test]
    fn source_checkout_is_untouched_by_worktree_lifecycle() {
        let (tmp, repo) = create_test_repo();
        let sha = head_commit(&repo).unwrap();
        let wt_path = tmp.path().join("wt");

        let wt = make_worktree(&repo, &wt_path, &sha).unwrap();
        std::fs::write(wt_path.join("scratch.txt"), "x").unwrap();
        wt.remove().unwrap();

        assert_eq!(head_commit(&repo).unwrap(), sha);
        let status = run_git_stdout(&repo, &["status", "--porcelain"]).unwrap();
        assert!(status.is_empty());
    }
}
