//! CI evaluation artifacts.
//!
//! The upstream CI evaluator uploads a `comparison` artifact per eval run
//! containing `changed-paths.json` with a `rebuildsByPlatform` table. When
//! that artifact is available for the PR's head commit, the change set
//! comes for free and no local evaluation is needed.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;

use serde::Deserialize;

use crate::types::{Attribute, Sha, System};

use super::client::GithubClient;
use super::error::ApiError;

/// Workflow names that produce the comparison artifact. "Eval" is the
/// older name, kept through the transition to the combined "PR" workflow.
const EVAL_WORKFLOWS: [&str; 2] = ["Eval", "PR"];

const ARTIFACT_NAME: &str = "comparison";
const CHANGED_PATHS_FILE: &str = "changed-paths.json";

#[derive(Debug, Deserialize)]
pub(super) struct WorkflowRunsResponse {
    #[serde(default)]
    pub workflow_runs: Vec<WorkflowRun>,
}

#[derive(Debug, Deserialize)]
pub(super) struct WorkflowRun {
    pub name: String,
    pub artifacts_url: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct ArtifactsResponse {
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Deserialize)]
pub(super) struct Artifact {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub expired: bool,
}

#[derive(Debug, Deserialize)]
struct ChangedPaths {
    #[serde(rename = "rebuildsByPlatform", default)]
    rebuilds_by_platform: Option<BTreeMap<String, Vec<String>>>,
}

/// Fetches the CI evaluator's rebuild table for a head commit.
///
/// Returns `Ok(None)` when no fresh artifact exists yet (the caller
/// decides whether to wait, fall back to local eval, or fail). Attribute
/// names that do not parse are dropped with a warning rather than
/// aborting the review.
pub async fn fetch_ci_rebuilds(
    client: &GithubClient,
    head_sha: &Sha,
) -> Result<Option<BTreeMap<System, BTreeSet<Attribute>>>, ApiError> {
    let runs = client.workflow_runs(head_sha).await?;
    for run in runs
        .workflow_runs
        .iter()
        .filter(|r| EVAL_WORKFLOWS.contains(&r.name.as_str()))
    {
        let artifacts = client.artifacts_at(&run.artifacts_url).await?;
        for artifact in artifacts.artifacts.iter().filter(|a| a.name == ARTIFACT_NAME) {
            if artifact.expired {
                return Err(ApiError::from_status(
                    410,
                    format!("artifact {} has expired", artifact.id),
                    None,
                ));
            }
            let bytes = client.get_bytes(&client.artifact_zip_url(artifact.id)).await?;
            let changed = parse_comparison_zip(&bytes)?;
            if let Some(by_platform) = changed.rebuilds_by_platform {
                return Ok(Some(parse_rebuild_table(by_platform)));
            }
        }
    }
    Ok(None)
}

/// Extracts `changed-paths.json` from the artifact zip.
fn parse_comparison_zip(bytes: &[u8]) -> Result<ChangedPaths, ApiError> {
    let reader = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(reader)
        .map_err(|e| ApiError::permanent(format!("invalid artifact zip: {e}")))?;
    let mut file = archive
        .by_name(CHANGED_PATHS_FILE)
        .map_err(|e| ApiError::permanent(format!("{CHANGED_PATHS_FILE} missing from artifact: {e}")))?;
    let mut content = String::new();
    file.read_to_string(&mut content)
        .map_err(|e| ApiError::permanent(format!("failed to read {CHANGED_PATHS_FILE}: {e}")))?;
    serde_json::from_str(&content)
        .map_err(|e| ApiError::permanent(format!("malformed {CHANGED_PATHS_FILE}: {e}")))
}

fn parse_rebuild_table(
    by_platform: BTreeMap<String, Vec<String>>,
) -> BTreeMap<System, BTreeSet<Attribute>> {
    let mut out = BTreeMap::new();
    for (system, names) in by_platform {
        let mut attrs = BTreeSet::new();
        for name in names {
            match Attribute::parse(&name) {
                Ok(attr) => {
                    attrs.insert(attr);
                }
                Err(err) => {
                    tracing::warn!(%err, "skipping unparseable attribute from CI artifact");
                }
            }
        }
        out.insert(System::new(system), attrs);
    }
    out
}
