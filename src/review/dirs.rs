//! Review directory lifecycle.
//!
//! Every review owns two locations: a cache directory under
//! `$XDG_CACHE_HOME/nixpkgs-review/<name>/` for logs, reports and the
//! `results/` tree, and a worktree path under `.review/<name>/` relative
//! to the outer repository root. Cache directory names gain a `-<n>`
//! suffix when a previous review of the same target is still around.

use std::path::{Path, PathBuf};

use crate::errors::Error;
use crate::types::{PrNumber, Sha};

/// Naming for the three review modes.
#[derive(Debug, Clone)]
pub enum ReviewTarget {
    Pr(PrNumber),
    Rev(Sha),
    /// Working-tree review, stamped for uniqueness.
    Wip { timestamp: i64 },
}

impl ReviewTarget {
    pub fn dir_name(&self) -> String {
        match self {
            ReviewTarget::Pr(pr) => format!("pr-{}", pr.0),
            ReviewTarget::Rev(sha) => format!("rev-{}", sha.short()),
            ReviewTarget::Wip { timestamp } => format!("wip-{timestamp}"),
        }
    }

    pub fn pr(&self) -> Option<PrNumber> {
        match self {
            ReviewTarget::Pr(pr) => Some(*pr),
            _ => None,
        }
    }
}

/// The on-disk locations of one review.
#[derive(Debug, Clone)]
pub struct ReviewDir {
    cache_dir: PathBuf,
    worktree_path: PathBuf,
}

impl ReviewDir {
    /// Creates the cache directory (suffixing `-<n>` on collision) and
    /// reserves the worktree path under the repository root.
    pub fn create(cache_root: &Path, repo_root: &Path, target: &ReviewTarget) -> Result<Self, Error> {
        let name = target.dir_name();
        let cache_dir = create_unique_dir(cache_root, &name)?;
        let worktree_path = repo_root.join(".review").join(&name);
        Ok(ReviewDir {
            cache_dir,
            worktree_path,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn worktree_path(&self) -> &Path {
        &self.worktree_path
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.cache_dir.join("logs")
    }

    /// The materialised nixpkgs config for this run.
    pub fn nixpkgs_config_path(&self) -> PathBuf {
        self.cache_dir.join("config.nix")
    }

    /// The generated per-system attribute list handed to the shell.
    pub fn attrs_path(&self) -> PathBuf {
        self.cache_dir.join("attrs.nix")
    }
}

fn create_unique_dir(root: &Path, name: &str) -> Result<PathBuf, Error> {
    for counter in 0..1000 {
        let candidate = if counter == 0 {
            root.join(name)
        } else {
            root.join(format!("{name}-{counter}"))
        };
        match std::fs::create_dir_all(candidate.parent().expect("cache root has a parent")) {
            Ok(()) => {}
            Err(err) => return Err(Error::Io(err)),
        }
        match std::fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(Error::Io(err)),
        }
    }
    Err(Error::Internal(format!(
        "could not create a cache directory for {name} after 1000 attempts"
    )))
}
