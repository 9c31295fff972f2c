//! Ref fetches into the `refs/nixpkgs-review/<n>` namespace.
//!
//! Fetches never write to user-visible refs. Concurrent reviews serialize
//! behind an advisory lock file in the git dir, the only critical section
//! that writes to the shared object database.

use std::fs::OpenOptions;
use std::path::Path;

use crate::types::Sha;

use super::{GitError, GitResult, git_dir, is_shallow, run_git_stdout, run_git_sync};

/// Exclusive advisory lock on `<gitdir>/nixpkgs-review.lock`.
struct FetchLock {
    file: std::fs::File,
}

impl FetchLock {
    fn acquire(workdir: &Path) -> GitResult<Self> {
        let lock_path = git_dir(workdir)?.join("nixpkgs-review.lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        // SAFETY: flock(2) on a descriptor we own.
        let rc = unsafe { libc::flock(std::os::fd::AsRawFd::as_raw_fd(&file), libc::LOCK_EX) };
        if rc != 0 {
            return Err(GitError::Io(std::io::Error::last_os_error()));
        }
        Ok(FetchLock { file })
    }
}

impl Drop for FetchLock {
    fn drop(&mut self) {
        // SAFETY: unlocking the descriptor we locked.
        unsafe {
            libc::flock(std::os::fd::AsRawFd::as_raw_fd(&self.file), libc::LOCK_UN);
        }
    }
}

/// Fetch `refs` from `remote` into `refs/nixpkgs-review/<i>` and resolve
/// each to a commit SHA. Shallow clones fetch with `--depth`.
pub fn fetch_refs(
    workdir: &Path,
    remote: &str,
    refs: &[&str],
    shallow_depth: u32,
) -> GitResult<Vec<Sha>> {
    let _lock = FetchLock::acquire(workdir)?;

    let mut args: Vec<String> = vec![
        "-c".into(),
        "fetch.prune=false".into(),
        "fetch".into(),
        "--no-tags".into(),
        "--force".into(),
        remote.into(),
    ];
    if is_shallow(workdir)? {
        args.push(format!("--depth={shallow_depth}"));
    }
    for (i, r) in refs.iter().enumerate() {
        args.push(format!("{r}:refs/nixpkgs-review/{i}"));
    }
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    run_git_sync(workdir, &arg_refs).map_err(|e| match e {
        GitError::CommandFailed { stderr, .. } => GitError::FetchFailed {
            refspec: refs.join(" "),
            details: stderr,
        },
        other => other,
    })?;

    let mut shas = Vec::with_capacity(refs.len());
    for i in 0..refs.len() {
        let sha_str = run_git_stdout(
            workdir,
            &["rev-parse", "--verify", &format!("refs/nixpkgs-review/{i}")],
        )?;
        shas.push(Sha::parse(&sha_str)?);
    }
    Ok(shas)
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::{head_commit, run_git_stdout, run_git_sync};
    use super::*;

    #[test]
    fn fetch_refs_resolves_fetched_shas() {
        let (_tmp, upstream) = create_test_repo();
        let upstream_head = head_commit(&upstream).unwrap();

        let (_tmp2, local) = create_test_repo();
        let shas = fetch_refs(&local, upstream.to_str().unwrap(), &["main"], 1).unwrap();
        assert_eq!(shas, vec![upstream_head]);

        // The fetched ref lives in the dedicated namespace.
        let resolved =
            run_git_stdout(&local, &["rev-parse", "refs/nixpkgs-review/0"]).unwrap();
        assert_eq!(resolved, shas[0].as_str());
    }

    #[test]
    fn fetch_refs_overwrites_previous_namespace_entry() {
        let (_tmp, upstream) = create_test_repo();
        let (_tmp2, local) = create_test_repo();

        fetch_refs(&local, upstream.to_str().unwrap(), &["main"], 1).unwrap();
        let new_head = commit_file(&upstream, "next.txt", "x", "next");
        let shas = fetch_refs(&local, upstream.to_str().unwrap(), &["main"], 1).unwrap();
        assert_eq!(shas, vec![new_head]);
    }

    #[test]
    fn fetch_refs_fails_for_missing_ref() {
        let (_tmp, upstream) = create_test_repo();
        let (_tmp2, local) = create_test_repo();
        let err =
            fetch_refs(&local, upstream.to_str().unwrap(), &["no-such-branch"], 1).unwrap_err();
        assert!(matches!(err, GitError::FetchFailed { .. }));
    }

    #[test]
    fn fetch_does_not_touch_local_head() {
        let (_tmp, upstream) = create_test_repo();
        commit_file(&upstream, "b.txt", "b", "more");
        let (_tmp2, local) = create_test_repo();
        let before = head_commit(&local).unwrap();
        fetch_refs(&local, upstream.to_str().unwrap(), &["main"], 1).unwrap();
        assert_eq!(head_commit(&local).unwrap(), before);
        run_git_sync(&local, &["status", "--porcelain"]).unwrap();
    }
}
