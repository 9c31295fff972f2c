//! GitHub API error types.
//!
//! Errors distinguish transient from permanent failures:
//!
//! - **Transient** errors are retriable (5xx, rate limits, network-level
//!   failures)
//! - **Permanent** errors require intervention (most 4xx: bad token,
//!   missing PR, approving your own PR)
//!
//! Rate-limited responses carry the server-announced wait so the retry
//! layer can honour it instead of guessing.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The kind of API error, categorized for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Safe to retry with backoff.
    Transient,

    /// Retrying will not help.
    Permanent,
}

impl ApiErrorKind {
    pub fn is_retriable(&self) -> bool {
        matches!(self, ApiErrorKind::Transient)
    }
}

/// A GitHub API error with categorization for retry decisions.
#[derive(Debug, Error)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Server-requested wait before the next attempt (rate limiting).
    pub retry_after: Option<Duration>,
    #[source]
    pub source: Option<reqwest::Error>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "GitHub API error (HTTP {}): {}", code, self.message),
            None => write!(f, "GitHub API error: {}", self.message),
        }
    }
}

impl ApiError {
    /// Categorizes an HTTP response status together with rate-limit headers.
    pub fn from_status(
        status: u16,
        message: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        let kind = match status {
            429 => ApiErrorKind::Transient,
            403 if retry_after.is_some() => ApiErrorKind::Transient,
            500..=599 => ApiErrorKind::Transient,
            _ => ApiErrorKind::Permanent,
        };
        ApiError {
            kind,
            status: Some(status),
            message: message.into(),
            retry_after,
            source: None,
        }
    }

    /// Categorizes a reqwest transport error. Connect/timeout failures are
    /// transient, everything else (e.g. body decode) is permanent.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        let kind = if err.is_connect() || err.is_timeout() || err.is_request() {
            ApiErrorKind::Transient
        } else {
            ApiErrorKind::Permanent
        };
        ApiError {
            kind,
            status,
            message: err.to_string(),
            retry_after: None,
            source: Some(err),
        }
    }

    /// A permanent error with no underlying transport failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        ApiError {
            kind: ApiErrorKind::Permanent,
            status: None,
            message: message.into(),
            retry_after: None,
            source: None,
        }
    }

    /// A transient error with no underlying transport failure.
    pub fn transient(message: impl Into<String>) -> Self {
        ApiError {
            kind: ApiErrorKind::Transient,
            status: None,
            message: message.into(),
            retry_after: None,
            source: None,
        }
    }

    /// A one-line suggestion for recognised failure modes, shown under the
    /// stderr error header.
    pub fn hint(&self) -> Option<String> {
        match self.status {
            Some(401) => Some("set `GITHUB_TOKEN` (or `GITHUB_TOKEN_CMD`) to authenticate".into()),
            Some(403) | Some(429) => self.retry_after.map(|wait| {
                format!("rate-limit exceeded, retry in {} s", wait.as_secs())
            }),
            Some(410) => Some(
                "the CI artifact has expired; re-run CI or pass `--eval local`".into(),
            ),
            _ => None,
        }
    }
}

/// Parses rate-limit headers into a wait duration.
///
/// Honours `Retry-After` (seconds) and `X-RateLimit-Reset` (epoch
/// seconds, relative to `now`).
pub fn retry_after_from_headers(
    headers: &reqwest::header::HeaderMap,
    now_epoch: u64,
) -> Option<Duration> {
    if let Some(value) = headers.get("retry-after") {
        if let Ok(secs) = value.to_str().unwrap_or("").parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
    }
    let remaining = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if remaining == Some(0) {
        if let Some(reset) = headers
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            return Some(Duration::from_secs(reset.saturating_sub(now_epoch)));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn server_errors_are_transient() {
        assert_eq!(
            ApiError::from_status(502, "bad gateway", None).kind,
            ApiErrorKind::Transient
        );
        assert_eq!(
            ApiError::from_status(429, "rate limited", None).kind,
            ApiErrorKind::Transient
        );
    }

    #[test]
    fn client_errors_are_permanent() {
        assert_eq!(
            ApiError::from_status(404, "not found", None).kind,
            ApiErrorKind::Permanent
        );
        assert_eq!(
            ApiError::from_status(422, "unprocessable", None).kind,
            ApiErrorKind::Permanent
        );
    }

    #[test]
    fn rate_limited_403_is_transient() {
        let err = ApiError::from_status(403, "rate limit", Some(Duration::from_secs(30)));
        assert_eq!(err.kind, ApiErrorKind::Transient);
        assert_eq!(err.hint(), Some("rate-limit exceeded, retry in 30 s".into()));
    }

    #[test]
    fn unauthorized_hints_at_token() {
        let err = ApiError::from_status(401, "unauthorized", None);
        assert!(err.hint().unwrap().contains("GITHUB_TOKEN"));
    }

    #[test]
    fn retry_after_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("42"));
        assert_eq!(
            retry_after_from_headers(&headers, 0),
            Some(Duration::from_secs(42))
        );
    }

    #[test]
    fn ratelimit_reset_is_relative_to_now() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1100"));
        assert_eq!(
            retry_after_from_headers(&headers, 1000),
            Some(Duration::from_secs(100))
        );
    }

    #[test]
    fn ratelimit_reset_ignored_with_remaining_budget() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("10"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1100"));
        assert_eq!(retry_after_from_headers(&headers, 1000), None);
    }
}
