//! GitHub client for PR metadata, CI artifacts and review actions.
//!
//! The client distinguishes transient from permanent failures so the
//! retry layer knows what is safe to repeat, and scopes every call to the
//! upstream nixpkgs repository.

pub mod artifacts;
pub mod client;
pub mod error;
pub mod retry;

pub use artifacts::fetch_ci_rebuilds;
pub use client::{CheckRun, Comment, GithubClient, PrSpec};
pub use error::{ApiError, ApiErrorKind};
pub use retry::{RetryConfig, retry_with_backoff};
