//! Top-level error taxonomy and exit-code mapping.
//!
//! Components surface typed errors (`git::GitError`, `github::ApiError`,
//! `process::ProcessError`, ...); the orchestrator is the sole sink and
//! rolls them up into this enum. Build failures are data, not errors, and
//! never appear here.

use thiserror::Error;

/// Exit code for a run where every build succeeded.
pub const EXIT_SUCCESS: i32 = 0;
/// One or more builds failed (or a VCS/eval error aborted the run).
pub const EXIT_FAILURE: i32 = 1;
/// Command line could not be interpreted.
pub const EXIT_USAGE: i32 = 2;
/// Remote or network error talking to the code host.
pub const EXIT_NETWORK: i32 = 3;
/// Interrupted by SIGINT.
pub const EXIT_INTERRUPTED: i32 = 130;
/// Internal invariant violation.
pub const EXIT_INTERNAL: i32 = 70;

/// Errors that abort a review run.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration or command-line usage error.
    #[error("{0}")]
    Usage(String),

    /// Network-level failure talking to the code host.
    #[error("network error: {0}")]
    Network(#[from] crate::github::ApiError),

    /// Local VCS operation failed.
    #[error(transparent)]
    Vcs(#[from] crate::git::GitError),

    /// Evaluation failed; the review would be incomplete.
    #[error("evaluation failed: {0}")]
    Eval(String),

    /// Child process plumbing failed outside of a build.
    #[error(transparent)]
    Process(#[from] crate::process::ProcessError),

    /// The run was cancelled by SIGINT.
    #[error("interrupted")]
    Cancelled,

    /// Invariant violation; a bug in this program.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Maps the error to its process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Usage(_) => EXIT_USAGE,
            Error::Network(_) => EXIT_NETWORK,
            Error::Vcs(_) | Error::Eval(_) => EXIT_FAILURE,
            Error::Process(_) | Error::Io(_) => EXIT_FAILURE,
            Error::Cancelled => EXIT_INTERRUPTED,
            Error::Internal(_) => EXIT_INTERNAL,
        }
    }

    /// A one-line hint appended to the stderr report for recognised
    /// remote failures.
    pub fn hint(&self) -> Option<String> {
        match self {
            Error::Network(api) => api.hint(),
            _ => None,
        }
    }
}

/// Result alias used by the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
