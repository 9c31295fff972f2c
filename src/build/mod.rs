//! Build scheduling: realise the resolved derivations in parallel.
//!
//! Derivation paths are deduplicated across systems and dispatched to the
//! external builder under a bounded semaphore. The builder handles
//! dependency ordering itself and `--keep-going` is mandatory, since
//! partial failure is the common case; this layer only rate-limits,
//! captures logs and classifies outcomes.

mod nom;

pub use nom::NomFunnel;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::process::{self, RunOptions, interrupted};
use crate::types::{Attribute, System};

/// How long in-flight builders get to observe a propagated SIGINT before
/// their tasks are aborted.
const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// One derivation to build, with every (attribute, system) pair that
/// resolved to it.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub drv_path: String,
    /// Attribution for logs and the report; the first entry names the log.
    pub holders: Vec<(Attribute, System)>,
    pub log_path: PathBuf,
    /// Store paths the derivation is expected to produce.
    pub expected_outputs: Vec<PathBuf>,
}

/// Terminal state of one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Built,
    Failed,
}

/// Outcome of one dispatched (or skipped) build.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub request: BuildRequest,
    pub status: BuildStatus,
}

/// Scheduler knobs.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// In-flight build cap; defaults to the CPU count upstream.
    pub max_jobs: usize,
    /// Extra arguments appended verbatim to every builder invocation.
    pub build_args: Vec<String>,
    /// Funnel all build output through one `nom` process when available.
    pub use_nom: bool,
}

/// Deduplicates per-system evaluation results into build requests.
///
/// Two attributes (or the same attribute on two systems) sharing a
/// derivation path become one request with several holders. Request order
/// follows the first holder's attribute name, so dispatch order is
/// deterministic.
pub fn dedup_requests(
    resolved: impl IntoIterator<Item = (Attribute, System, String, Vec<PathBuf>)>,
    log_dir: &std::path::Path,
    qualify_logs_by_system: bool,
) -> Vec<BuildRequest> {
    let mut by_drv: BTreeMap<String, BuildRequest> = BTreeMap::new();
    for (attr, system, drv_path, outputs) in resolved {
        by_drv
            .entry(drv_path.clone())
            .or_insert_with(|| {
                let log_name = if qualify_logs_by_system {
                    format!("{attr}-{system}.log")
                } else {
                    format!("{attr}.log")
                };
                BuildRequest {
                    drv_path,
                    holders: Vec::new(),
                    log_path: log_dir.join(log_name),
                    expected_outputs: outputs,
                }
            })
            .holders
            .push((attr, system));
    }
    let mut requests: Vec<BuildRequest> = by_drv.into_values().collect();
    for request in &mut requests {
        request.holders.sort();
    }
    requests.sort_by(|a, b| a.holders[0].cmp(&b.holders[0]));
    requests
}

/// Builds all requests with bounded parallelism.
///
/// On SIGINT no new builds are dispatched; in-flight builders get a grace
/// period to observe the propagated signal, then survivors are killed.
/// Requests never dispatched classify as `Failed`, so partial results
/// still partition the candidate set.
pub async fn build_all(requests: Vec<BuildRequest>, opts: &BuildOptions) -> Vec<BuildResult> {
    if requests.is_empty() {
        tracing::info!("nothing to build");
        return Vec::new();
    }

    if let Some(parent) = requests[0].log_path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            tracing::warn!(%err, "cannot create log directory");
        }
    }

    let funnel = if opts.use_nom {
        NomFunnel::spawn().await
    } else {
        None
    };

    let semaphore = Arc::new(Semaphore::new(opts.max_jobs.max(1)));
    let mut tasks: JoinSet<BuildResult> = JoinSet::new();
    let mut skipped: Vec<BuildResult> = Vec::new();

    for request in requests {
        if interrupted() {
            // Cancellation: stop dispatching, record the remainder.
            skipped.push(BuildResult {
                request,
                status: BuildStatus::Failed,
            });
            continue;
        }
        let semaphore = semaphore.clone();
        let build_args = opts.build_args.clone();
        let lines_tx = funnel.as_ref().map(NomFunnel::sender);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            if interrupted() {
                return BuildResult {
                    request,
                    status: BuildStatus::Failed,
                };
            }
            let status = build_one(&request, &build_args, lines_tx).await;
            BuildResult { request, status }
        });
    }

    let mut results = collect_with_cancellation(tasks).await;
    results.append(&mut skipped);
    results
}

/// Drains the task set; once interrupted, allows the grace period then
/// aborts survivors (killing their children).
async fn collect_with_cancellation(mut tasks: JoinSet<BuildResult>) -> Vec<BuildResult> {
    let mut results = Vec::new();
    loop {
        let next = if interrupted() {
            match tokio::time::timeout(CANCEL_GRACE, tasks.join_next()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::warn!(remaining = tasks.len(), "killing builds that ignored SIGINT");
                    tasks.abort_all();
                    while let Some(joined) = tasks.join_next().await {
                        if let Ok(result) = joined {
                            results.push(result);
                        }
                    }
                    break;
                }
            }
        } else {
            tasks.join_next().await
        };
        match next {
            Some(Ok(result)) => results.push(result),
            Some(Err(err)) => tracing::warn!(%err, "build task aborted"),
            None => break,
        }
    }
    results
}

/// Runs one builder invocation and classifies the outcome.
///
/// `Built` requires the builder to exit zero *and* every expected output
/// to exist in the store afterwards; a missing output means a different
/// failure mode (e.g. a remote builder that never substituted back).
async fn build_one(
    request: &BuildRequest,
    build_args: &[String],
    lines_tx: Option<tokio::sync::mpsc::UnboundedSender<String>>,
) -> BuildStatus {
    let (attr, system) = &request.holders[0];
    tracing::info!(%attr, %system, drv = %request.drv_path, "building");

    let mut args: Vec<String> = vec!["--no-link".into(), "--keep-going".into()];
    args.extend(build_args.iter().cloned());
    args.push(request.drv_path.clone());

    let run = process::run(
        "nix-build",
        &args,
        RunOptions {
            tee: Some(request.log_path.clone()),
            stdout_lines: lines_tx,
            ..RunOptions::default()
        },
    )
    .await;

    let exit_ok = match run {
        Ok(output) => output.success(),
        Err(err) => {
            tracing::warn!(%attr, %err, "builder failed to run");
            false
        }
    };
    if !exit_ok {
        return BuildStatus::Failed;
    }
    if !request.expected_outputs.iter().all(|p| p.exists()) {
        tracing::warn!(%attr, "builder succeeded but outputs are missing from the store");
        return BuildStatus::Failed;
    }
    BuildStatus::Built
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(s: &str) -> Attribute {
        Attribute::parse(s).unwrap()
    }

    fn system(s: &str) -> System {
        System::new(s)
    }

    #[test]
    fn dedup_merges_shared_drvs() {
        let log_dir = PathBuf::from("/logs");
        let requests = dedup_requests(
            [
                (
                    attr("hello"),
                    system("x86_64-linux"),
                    "/nix/store/h.drv".to_string(),
                    vec![],
                ),
                (
                    attr("helloAlias"),
                    system("x86_64-linux"),
                    "/nix/store/h.drv".to_string(),
                    vec![],
                ),
            ],
            &log_dir,
            false,
        );
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].holders.len(), 2);
    }

    #[test]
    fn dedup_unqualified_log_names() {
        let requests = dedup_requests(
            [(
                attr("fail"),
                system("x86_64-linux"),
                "/nix/store/f.drv".to_string(),
                vec![],
            )],
            &PathBuf::from("/logs"),
            false,
        );
        assert_eq!(requests[0].log_path, PathBuf::from("/logs/fail.log"));
    }

    #[test]
    fn dedup_qualified_log_names_for_multi_system_runs() {
        let requests = dedup_requests(
            [(
                attr("fail"),
                system("aarch64-linux"),
                "/nix/store/f.drv".to_string(),
                vec![],
            )],
            &PathBuf::from("/logs"),
            true,
        );
        assert_eq!(
            requests[0].log_path,
            PathBuf::from("/logs/fail-aarch64-linux.log")
        );
    }

    #[test]
    fn dedup_orders_requests_by_attribute() {
        let requests = dedup_requests(
            [
                (
                    attr("zsh"),
                    system("x86_64-linux"),
                    "/nix/store/z.drv".to_string(),
                    vec![],
                ),
                (
                    attr("bash"),
                    system("x86_64-linux"),
                    "/nix/store/b.drv".to_string(),
                    vec![],
                ),
            ],
            &PathBuf::from("/logs"),
            false,
        );
        assert_eq!(requests[0].holders[0].0.as_str(), "bash");
        assert_eq!(requests[1].holders[0].0.as_str(), "zsh");
    }

    #[tokio::test]
    async fn build_all_with_no_requests_is_empty() {
        let opts = BuildOptions {
            max_jobs: 2,
            build_args: vec![],
            use_nom: false,
        };
        assert!(build_all(Vec::new(), &opts).await.is_empty());
    }
}
