//! The review orchestrator: a sequential state machine connecting the
//! worktree manager, change-set resolver, evaluator dispatcher, build
//! scheduler and result aggregator.
//!
//! ```text
//! PrepareWorktrees -> ResolveChangeSet -> EvaluateSystems
//!   -> ScheduleBuilds -> WriteReport -> { post? approve? merge? }
//!   -> { LaunchShell | Exit }
//! ```
//!
//! The orchestrator exclusively owns the review directory and worktree
//! for the duration of a run; worktrees are destroyed on normal exit and
//! preserved on failure for post-mortem inspection.

mod dirs;
mod shell;

pub use dirs::{ReviewDir, ReviewTarget};
pub use shell::{launch_shell, write_attrs_file};

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::build::{self, BuildOptions, BuildStatus};
use crate::changeset::{self, Filters, filter_candidates};
use crate::config::{BuildGraph, Checkout, Config, EvalMode};
use crate::errors::{Error, Result};
use crate::eval::{EvalContext, EvaluatedAttr, evaluate_systems};
use crate::git::{self, Worktree};
use crate::github::{GithubClient, fetch_ci_rebuilds};
use crate::process::interrupted;
use crate::report::{ClassifiedAttr, Report, ReportContext};
use crate::types::{
    Attribute, Outcome, PrNumber, Sha, System, current_system_name,
};

/// Summary of one completed review, for exit-code plumbing.
#[derive(Debug)]
pub struct ReviewSummary {
    /// False when any build failed.
    pub success: bool,
}

/// One review run over a single target.
pub struct Review {
    config: Config,
    local_system: System,
    repo_root: PathBuf,
    cache_root: PathBuf,
}

impl Review {
    pub fn new(config: Config) -> Result<Review> {
        config.validate()?;
        let repo_root = git::top_level(&std::env::current_dir()?)?;
        let cache_root = crate::config::cache_root()?;
        Ok(Review {
            config,
            local_system: current_system_name(),
            repo_root,
            cache_root,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn client(&self) -> Result<GithubClient> {
        Ok(GithubClient::new(self.config.token.as_deref())?)
    }

    /// Review a pull request.
    pub async fn run_pr(&self, pr: PrNumber) -> Result<ReviewSummary> {
        let client = self.client()?;
        let spec = client.pull_request(pr).await?;
        tracing::info!(pr = pr.0, title = %spec.title, "reviewing pull request");

        let target = ReviewTarget::Pr(pr);
        let dir = ReviewDir::create(&self.cache_root, &self.repo_root, &target)?;
        self.write_run_config(&dir)?;

        // The CI evaluator's artifact replaces local evaluation when it
        // covers every requested system.
        let ci_candidates = self.ci_candidates(&client, &spec.head.sha).await?;

        let (worktree, head_commit, candidates) = match ci_candidates {
            Some(mut by_system) => {
                let [merge_rev] = self.fetch_pr_refs(&spec)?;
                let head_rev = git::verify_commit(&self.repo_root, &format!("{merge_rev}^2"))?;
                let checkout_rev = match self.config.checkout {
                    Checkout::Merge => merge_rev,
                    Checkout::Commit => head_rev,
                };
                let worktree =
                    git::make_worktree(&self.repo_root, dir.worktree_path(), &checkout_rev)?;
                by_system.retain(|system, _| self.config.systems.contains(system));
                (worktree, checkout_rev, by_system)
            }
            None => self.prepare_and_diff_pr(&spec, &dir).await?,
        };

        self.finish(
            dir,
            worktree,
            target,
            Some(head_commit),
            candidates,
            Some(&client),
        )
        .await
    }

    /// Review a local revision: base is `rev^`, head is `rev`.
    pub async fn run_rev(&self, rev: &str) -> Result<ReviewSummary> {
        let head = git::verify_commit(&self.repo_root, rev)?;
        let base = git::verify_commit(&self.repo_root, &format!("{head}^"))?;
        tracing::info!(rev = %head.short(), "reviewing local revision");

        let target = ReviewTarget::Rev(head.clone());
        let dir = ReviewDir::create(&self.cache_root, &self.repo_root, &target)?;
        self.write_run_config(&dir)?;

        let (worktree, candidates) = self
            .diff_commits(&dir, &base, &head, None)
            .await?;
        self.finish(dir, worktree, target, Some(head), candidates, None)
            .await
    }

    /// Review the working tree (or the index with `staged`).
    pub async fn run_wip(&self, staged: bool) -> Result<ReviewSummary> {
        let Some(head) = git::tree_snapshot(&self.repo_root, staged)? else {
            tracing::info!("no diff detected, stopping review");
            return Ok(ReviewSummary { success: true });
        };
        let base = git::head_commit(&self.repo_root)?;
        tracing::info!(snapshot = %head.short(), "reviewing working tree");

        let target = ReviewTarget::Wip {
            timestamp: chrono::Utc::now().timestamp(),
        };
        let dir = ReviewDir::create(&self.cache_root, &self.repo_root, &target)?;
        self.write_run_config(&dir)?;

        let (worktree, candidates) = self
            .diff_commits(&dir, &base, &head, None)
            .await?;
        self.finish(dir, worktree, target, Some(head), candidates, None)
            .await
    }

    /// Whether CI artifacts can replace local evaluation, and the table
    /// when they do.
    async fn ci_candidates(
        &self,
        client: &GithubClient,
        head_sha: &Sha,
    ) -> Result<Option<BTreeMap<System, BTreeSet<Attribute>>>> {
        match self.config.eval {
            EvalMode::Local => return Ok(None),
            EvalMode::Auto | EvalMode::Ofborg => {}
        }
        // CI evaluates with the default nixpkgs config only; an explicit
        // include set also needs local evaluation for filtering.
        if !self.config.package.is_empty() || self.config.extra_nixpkgs_config.is_some() {
            if self.config.eval == EvalMode::Ofborg {
                return Err(Error::Usage(
                    "--eval ofborg cannot be combined with --package or --extra-nixpkgs-config"
                        .into(),
                ));
            }
            return Ok(None);
        }
        if self.config.token.is_none() {
            if self.config.eval == EvalMode::Ofborg {
                return Err(Error::Usage(
                    "--eval ofborg requires a GitHub token (set GITHUB_TOKEN)".into(),
                ));
            }
            tracing::warn!("no GitHub token provided, falling back to local evaluation");
            return Ok(None);
        }

        // Only consult artifacts once the CI evaluation actually
        // concluded; a run still in progress has nothing usable yet.
        let runs = client.check_runs(head_sha).await?;
        let eval_concluded = runs.iter().any(|run| {
            matches!(run.name.as_str(), "Eval" | "PR")
                && run.status == "completed"
                && run.conclusion.as_deref() == Some("success")
        });
        if !eval_concluded {
            if self.config.eval == EvalMode::Ofborg {
                return Err(Error::Eval(
                    "the CI evaluation has not completed successfully for this PR".into(),
                ));
            }
            tracing::info!("CI evaluation has not concluded, evaluating locally");
            return Ok(None);
        }

        let table = fetch_ci_rebuilds(client, head_sha).await?;
        match table {
            Some(by_system)
                if self
                    .config
                    .systems
                    .iter()
                    .all(|s| by_system.contains_key(s)) =>
            {
                tracing::info!("using CI evaluation results, no local evaluation needed");
                Ok(Some(by_system))
            }
            Some(_) | None => {
                if self.config.eval == EvalMode::Ofborg {
                    return Err(Error::Eval(
                        "no fresh CI evaluation artifact covers the requested systems".into(),
                    ));
                }
                tracing::info!("CI evaluation not available, evaluating locally");
                Ok(None)
            }
        }
    }

    /// Fetches the PR's merge commit into the review ref namespace.
    fn fetch_pr_refs(&self, spec: &crate::github::PrSpec) -> Result<[Sha; 1]> {
        let merge_sha = spec.merge_commit_sha.as_ref().ok_or_else(|| {
            Error::Vcs(git::GitError::MergeConflict {
                commit: spec.head.sha.to_string(),
                details: "the pull request has no merge commit (conflicts with its base)".into(),
            })
        })?;
        let shas = git::fetch_refs(&self.repo_root, &self.config.remote, &[merge_sha.as_str()], 2)?;
        Ok([shas
            .into_iter()
            .next()
            .expect("one refspec yields one sha")])
    }

    /// PR without usable CI artifacts: fetch refs and run the local diff.
    async fn prepare_and_diff_pr(
        &self,
        spec: &crate::github::PrSpec,
        dir: &ReviewDir,
    ) -> Result<(Worktree, Sha, BTreeMap<System, BTreeSet<Attribute>>)> {
        match &spec.merge_commit_sha {
            Some(_) => {
                let [merge_rev] = self.fetch_pr_refs(spec)?;
                let base_rev = git::verify_commit(&self.repo_root, &format!("{merge_rev}^1"))?;
                let head_rev = git::verify_commit(&self.repo_root, &format!("{merge_rev}^2"))?;
                let (worktree, candidates) = self
                    .diff_commits(dir, &base_rev, &head_rev, Some(&merge_rev))
                    .await?;
                let head_commit = match self.config.checkout {
                    Checkout::Merge => merge_rev,
                    Checkout::Commit => head_rev,
                };
                Ok((worktree, head_commit, candidates))
            }
            None => {
                // No merge commit upstream, typically a conflicted PR.
                // Attempt the merge locally: a conflict aborts with the
                // worktree preserved for inspection, while a clean merge
                // (GitHub may simply not have computed one yet) yields a
                // merge commit to diff against.
                let shas = git::fetch_refs(
                    &self.repo_root,
                    &self.config.remote,
                    &[&spec.base.base_ref, spec.head.sha.as_str()],
                    1,
                )?;
                let base_rev = shas[0].clone();
                let head_rev = shas[1].clone();
                let worktree =
                    git::make_worktree(&self.repo_root, dir.worktree_path(), &base_rev)?;
                let merge_rev = worktree.merge(&head_rev)?;
                let (worktree, candidates) = self
                    .diff_commits(dir, &base_rev, &head_rev, Some(&merge_rev))
                    .await?;
                let head_commit = match self.config.checkout {
                    Checkout::Merge => merge_rev,
                    Checkout::Commit => head_rev,
                };
                Ok((worktree, head_commit, candidates))
            }
        }
    }

    /// The local two-pass diff: evaluate the base tree, advance the
    /// worktree to the merged state, evaluate again and compare.
    async fn diff_commits(
        &self,
        dir: &ReviewDir,
        base: &Sha,
        head: &Sha,
        merge_rev: Option<&Sha>,
    ) -> Result<(Worktree, BTreeMap<System, BTreeSet<Attribute>>)> {
        let worktree = git::make_worktree(&self.repo_root, dir.worktree_path(), base)?;
        let ctx = self.eval_context(dir, &worktree);

        // An explicit include set without regexes needs no tree diff at
        // all: the candidates are exactly the requested packages.
        if !self.config.package.is_empty() && self.config.package_regex.is_empty() {
            self.advance_worktree(&worktree, head, merge_rev)?;
            let candidates: BTreeMap<System, BTreeSet<Attribute>> = self
                .config
                .systems
                .iter()
                .map(|s| (s.clone(), self.config.package.clone()))
                .collect();
            return Ok((worktree, candidates));
        }

        tracing::info!("local evaluation for computing rebuilds");
        let chunk_count = crate::config::available_cpus() * 4;

        let mut base_outputs = BTreeMap::new();
        for system in &self.config.systems {
            let names = changeset::list_attr_names(&ctx, system)
                .await
                .map_err(|e| Error::Eval(e.to_string()))?;
            let outputs = changeset::tree_outputs(&ctx, system, names, chunk_count)
                .await
                .map_err(|e| Error::Eval(e.to_string()))?;
            base_outputs.insert(system.clone(), outputs);
        }

        self.advance_worktree(&worktree, head, merge_rev)?;

        let mut candidates = BTreeMap::new();
        for system in &self.config.systems {
            let names = changeset::list_attr_names(&ctx, system)
                .await
                .map_err(|e| Error::Eval(e.to_string()))?;
            let merged = changeset::tree_outputs(&ctx, system, names, chunk_count)
                .await
                .map_err(|e| Error::Eval(e.to_string()))?;
            let changed = changeset::diff_trees(&base_outputs[system], &merged);
            tracing::info!(system = %system, rebuilds = changed.len(), "impacted packages");
            candidates.insert(system.clone(), changed);
        }
        Ok((worktree, candidates))
    }

    /// Moves the worktree from the base commit to the state under review.
    fn advance_worktree(
        &self,
        worktree: &Worktree,
        head: &Sha,
        merge_rev: Option<&Sha>,
    ) -> Result<()> {
        match self.config.checkout {
            Checkout::Commit => worktree.checkout(head)?,
            Checkout::Merge => match merge_rev {
                Some(merge) => worktree.checkout(merge)?,
                None => {
                    worktree.merge(head)?;
                }
            },
        }
        Ok(())
    }

    fn eval_context(&self, dir: &ReviewDir, worktree: &Worktree) -> EvalContext {
        EvalContext {
            nixpkgs_path: worktree.path().to_path_buf(),
            nixpkgs_config_path: dir.nixpkgs_config_path(),
            scratch_dir: dir.cache_dir().to_path_buf(),
            include_passthru_tests: self.config.include_passthru_tests,
            parallelism: self.config.eval_parallelism,
        }
    }

    fn write_run_config(&self, dir: &ReviewDir) -> Result<()> {
        std::fs::write(
            dir.nixpkgs_config_path(),
            self.config.nixpkgs_config_content(),
        )?;
        Ok(())
    }

    /// The tail of the pipeline, common to all modes: filter, evaluate,
    /// build, aggregate, report, post-process, shell.
    async fn finish(
        &self,
        dir: ReviewDir,
        worktree: Worktree,
        target: ReviewTarget,
        head_commit: Option<Sha>,
        candidates: BTreeMap<System, BTreeSet<Attribute>>,
        client: Option<&GithubClient>,
    ) -> Result<ReviewSummary> {
        let filters = Filters {
            package: self.config.package.clone(),
            package_regex: self.config.package_regex.clone(),
            skip_package: self.config.skip_package.clone(),
            skip_package_regex: self.config.skip_package_regex.clone(),
        };

        let mut selected = BTreeMap::new();
        let mut excluded = BTreeMap::new();
        for (system, system_candidates) in &candidates {
            let outcome = filter_candidates(system_candidates, &filters);
            selected.insert(system.clone(), outcome.selected);
            excluded.insert(system.clone(), outcome.excluded);
        }

        let ctx = self.eval_context(&dir, &worktree);
        let evaluated = evaluate_systems(&ctx, &selected)
            .await
            .map_err(|e| Error::Eval(e.to_string()))?;

        let qualify_logs = self.config.systems.len() > 1;
        let requests = build::dedup_requests(
            evaluated.iter().flat_map(|(system, attrs)| {
                attrs.iter().filter_map(|entry| {
                    let drv = entry.meta.drv_path.clone()?;
                    Some((
                        entry.attr.clone(),
                        system.clone(),
                        drv,
                        entry.meta.out_paths.values().cloned().collect(),
                    ))
                })
            }),
            &dir.logs_dir(),
            qualify_logs,
        );

        let build_results = build::build_all(
            requests,
            &BuildOptions {
                max_jobs: self.config.max_jobs,
                build_args: self.config.build_args.clone(),
                use_nom: self.config.build_graph == BuildGraph::Nom,
            },
        )
        .await;

        // Index build outcomes by (attr, system).
        let mut build_index: BTreeMap<(Attribute, System), (BuildStatus, PathBuf)> =
            BTreeMap::new();
        for result in &build_results {
            for (attr, system) in &result.request.holders {
                build_index.insert(
                    (attr.clone(), system.clone()),
                    (result.status, result.request.log_path.clone()),
                );
            }
        }

        let per_system = self.classify(&evaluated, &excluded, &build_index);

        let report = Report::new(self.report_context(&target, head_commit.as_ref()), per_system);
        report.write(dir.cache_dir())?;
        report.print_console(dir.cache_dir());

        if interrupted() {
            return Err(Error::Cancelled);
        }

        let success = report.succeeded();

        if let (Some(client), Some(pr)) = (client, target.pr()) {
            if self.config.post_result {
                client.comment_issue(pr, &report.markdown()).await?;
            }
            if self.config.approve && success {
                client
                    .approve_pr(
                        pr,
                        "Approved automatically following a successful `nixpkgs-review` run.",
                    )
                    .await?;
            }
            if self.config.merge && success {
                client.merge_pr(pr).await?;
            }
        }

        if self.config.print_result {
            println!("{}", report.markdown());
        }

        if !self.config.no_shell {
            if self.config.sandbox {
                tracing::warn!("sandbox mode is delegated to the shell wrapper; some things may break");
            }
            write_attrs_file(&dir.attrs_path(), &report.built_packages())?;
            launch_shell(
                dir.cache_dir(),
                &dir.attrs_path(),
                worktree.path(),
                &dir.nixpkgs_config_path(),
                &self.local_system,
                self.config.build_graph,
                self.config.run_command.as_deref(),
            )
            .await?;
        }

        // Normal exit: the worktree has served its purpose.
        if let Err(err) = worktree.remove() {
            tracing::warn!(%err, "failed to remove review worktree");
        }

        Ok(ReviewSummary { success })
    }

    fn report_context(&self, target: &ReviewTarget, commit: Option<&Sha>) -> ReportContext {
        ReportContext {
            pr: target.pr().map(|p| p.0),
            commit: commit.map(Sha::to_string),
            checkout: self.config.checkout.to_string(),
            extra_nixpkgs_config: self.config.extra_nixpkgs_config.clone(),
            only_packages: self.config.package.iter().map(Attribute::to_string).collect(),
            package_regex: self
                .config
                .package_regex
                .iter()
                .map(|r| r.as_str().to_string())
                .collect(),
            skip_packages: self
                .config
                .skip_package
                .iter()
                .map(Attribute::to_string)
                .collect(),
            skip_packages_regex: self
                .config
                .skip_package_regex
                .iter()
                .map(|r| r.as_str().to_string())
                .collect(),
            incomplete: interrupted(),
            show_logs: self.config.post_result || self.config.print_result,
        }
    }

    /// Merges evaluation metadata, filter exclusions and build outcomes
    /// into the per-system classified lists.
    fn classify(
        &self,
        evaluated: &BTreeMap<System, Vec<EvaluatedAttr>>,
        excluded: &BTreeMap<System, BTreeSet<Attribute>>,
        build_index: &BTreeMap<(Attribute, System), (BuildStatus, PathBuf)>,
    ) -> BTreeMap<System, Vec<ClassifiedAttr>> {
        let mut per_system = BTreeMap::new();
        for system in &self.config.systems {
            let mut entries = Vec::new();
            for attr in excluded.get(system).into_iter().flatten() {
                entries.push(ClassifiedAttr {
                    attr: attr.clone(),
                    outcome: Outcome::Blacklisted,
                    aliases: Vec::new(),
                    out_path: None,
                    log_path: None,
                });
            }
            for entry in evaluated.get(system).into_iter().flatten() {
                let key = (entry.attr.clone(), system.clone());
                let (status, log_path) = match build_index.get(&key) {
                    Some((status, log)) => (Some(*status), Some(log.clone())),
                    None => (None, None),
                };
                let outcome = classify_one(entry, status);
                entries.push(ClassifiedAttr {
                    attr: entry.attr.clone(),
                    outcome,
                    aliases: entry.aliases.clone(),
                    out_path: entry.meta.first_out_path().cloned(),
                    log_path,
                });
            }
            per_system.insert(system.clone(), entries);
        }
        per_system
    }
}

/// Outcome for one evaluated attribute given its build status.
fn classify_one(entry: &EvaluatedAttr, build: Option<BuildStatus>) -> Outcome {
    if !entry.meta.exists {
        return Outcome::NonExistent;
    }
    if entry.meta.broken {
        return Outcome::Broken;
    }
    let is_test =
        entry.attr.is_test() || entry.attr.as_str().contains(".passthru.tests.");
    match build {
        Some(BuildStatus::Built) if is_test => Outcome::Test,
        Some(BuildStatus::Built) => Outcome::Built,
        // Never dispatched (cancellation) counts as failed: the attribute
        // was buildable but has no outputs.
        Some(BuildStatus::Failed) | None => Outcome::Failed,
    }
}
