//! HTTP client scoped to the upstream nixpkgs repository.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::json;

use crate::types::{PrNumber, Sha};

use super::error::{ApiError, retry_after_from_headers};
use super::retry::{RetryConfig, retry_with_backoff};

const API_BASE: &str = "https://api.github.com";
const UPSTREAM: &str = "NixOS/nixpkgs";

/// Pull request metadata as returned by the code host.
#[derive(Debug, Clone, Deserialize)]
pub struct PrSpec {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub base: PrBase,
    pub head: PrHead,
    #[serde(default)]
    pub merge_commit_sha: Option<Sha>,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrBase {
    #[serde(rename = "ref")]
    pub base_ref: String,
    pub sha: Sha,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrHead {
    pub sha: Sha,
}

/// One CI check run attached to a commit.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckRun {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub details_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckRunsResponse {
    check_runs: Vec<CheckRun>,
}

/// An issue comment.
#[derive(Debug, Clone, Deserialize)]
pub struct Comment {
    pub body: String,
    pub user: CommentUser,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommentUser {
    pub login: String,
}

/// A GitHub API client scoped to the upstream repository.
#[derive(Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    retry: RetryConfig,
}

impl GithubClient {
    /// Creates a client; the token is optional but unauthenticated
    /// requests are heavily rate-limited.
    pub fn new(token: Option<&str>) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Accept",
            HeaderValue::from_static("application/vnd.github+json"),
        );
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("token {token}"))
                .map_err(|_| ApiError::permanent("token contains invalid header bytes"))?;
            headers.insert("Authorization", value);
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("nixpkgs-review/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(ApiError::from_reqwest)?;
        Ok(GithubClient {
            http,
            retry: RetryConfig::DEFAULT,
        })
    }

    async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let retry_after = retry_after_from_headers(resp.headers(), now);
        let message = resp.text().await.unwrap_or_default();
        Err(ApiError::from_status(status.as_u16(), message, retry_after))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = format!("{API_BASE}{path}");
        retry_with_backoff(self.retry, || async {
            let resp = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(ApiError::from_reqwest)?;
            let resp = Self::check_response(resp).await?;
            resp.json::<T>().await.map_err(ApiError::from_reqwest)
        })
        .await
    }

    pub(super) async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, ApiError> {
        retry_with_backoff(self.retry, || async {
            let resp = self
                .http
                .get(url)
                .send()
                .await
                .map_err(ApiError::from_reqwest)?;
            let resp = Self::check_response(resp).await?;
            Ok(resp.bytes().await.map_err(ApiError::from_reqwest)?.to_vec())
        })
        .await
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(), ApiError> {
        let url = format!("{API_BASE}{path}");
        retry_with_backoff(self.retry, || async {
            let mut req = self.http.request(method.clone(), &url);
            if let Some(body) = &body {
                req = req.json(body);
            }
            let resp = req.send().await.map_err(ApiError::from_reqwest)?;
            Self::check_response(resp).await.map(|_| ())
        })
        .await
    }

    /// `GET /repos/{o}/{r}/pulls/{n}`.
    pub async fn pull_request(&self, pr: PrNumber) -> Result<PrSpec, ApiError> {
        self.get_json(&format!("/repos/{UPSTREAM}/pulls/{}", pr.0)).await
    }

    /// `GET /repos/{o}/{r}/commits/{sha}/check-runs`.
    pub async fn check_runs(&self, sha: &Sha) -> Result<Vec<CheckRun>, ApiError> {
        let resp: CheckRunsResponse = self
            .get_json(&format!("/repos/{UPSTREAM}/commits/{sha}/check-runs"))
            .await?;
        Ok(resp.check_runs)
    }

    /// `GET /repos/{o}/{r}/issues/{n}/comments`.
    pub async fn comments(&self, pr: PrNumber) -> Result<Vec<Comment>, ApiError> {
        self.get_json(&format!("/repos/{UPSTREAM}/issues/{}/comments", pr.0))
            .await
    }

    /// Post the review report as a PR comment.
    pub async fn comment_issue(&self, pr: PrNumber, body: &str) -> Result<(), ApiError> {
        tracing::info!(pr = pr.0, "posting result comment");
        self.send_json(
            reqwest::Method::POST,
            &format!("/repos/{UPSTREAM}/issues/{}/comments", pr.0),
            Some(json!({ "body": body })),
        )
        .await
    }

    /// Approve the PR. Approving your own PR yields HTTP 422, which is
    /// surfaced as a warning rather than a failure.
    pub async fn approve_pr(&self, pr: PrNumber, body: &str) -> Result<(), ApiError> {
        tracing::info!(pr = pr.0, "approving");
        let result = self
            .send_json(
                reqwest::Method::POST,
                &format!("/repos/{UPSTREAM}/pulls/{}/reviews", pr.0),
                Some(json!({ "event": "APPROVE", "body": body })),
            )
            .await;
        match result {
            Err(e) if e.status == Some(422) => {
                tracing::warn!(
                    pr = pr.0,
                    "unable to approve; GitHub does not allow approving your own PR"
                );
                Ok(())
            }
            other => other,
        }
    }

    /// `PUT /repos/{o}/{r}/pulls/{n}/merge`. Requires committer access.
    pub async fn merge_pr(&self, pr: PrNumber) -> Result<(), ApiError> {
        tracing::info!(pr = pr.0, "merging");
        self.send_json(
            reqwest::Method::PUT,
            &format!("/repos/{UPSTREAM}/pulls/{}/merge", pr.0),
            None,
        )
        .await
    }

    /// Workflow runs for a head commit, used for artifact discovery.
    pub(super) async fn workflow_runs(
        &self,
        head_sha: &Sha,
    ) -> Result<super::artifacts::WorkflowRunsResponse, ApiError> {
        self.get_json(&format!(
            "/repos/{UPSTREAM}/actions/runs?head_sha={head_sha}"
        ))
        .await
    }

    /// Artifact listing for a workflow run.
    pub(super) async fn artifacts_at(
        &self,
        url: &str,
    ) -> Result<super::artifacts::ArtifactsResponse, ApiError> {
        retry_with_backoff(self.retry, || async {
            let resp = self
                .http
                .get(url)
                .send()
                .await
                .map_err(ApiError::from_reqwest)?;
            let resp = Self::check_response(resp).await?;
            resp.json().await.map_err(ApiError::from_reqwest)
        })
        .await
    }

    /// Download URL for an artifact zip.
    pub(super) fn artifact_zip_url(&self, artifact_id: u64) -> String {
        format!("{API_BASE}/repos/{UPSTREAM}/actions/artifacts/{artifact_id}/zip")
    }
}
