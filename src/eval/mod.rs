//! Evaluator dispatch: attribute names to per-system derivation metadata.
//!
//! The dispatcher writes the candidate attributes to a temporary JSON
//! file and hands it to the external evaluator together with the crate's
//! `evalAttrs.nix` expression. The expression converts every evaluation
//! error into data (`exists`/`broken` flags), so the returned JSON either
//! validates strictly against [`DerivationMeta`] or the review aborts.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::process::{self, ProcessError, RunOptions};
use crate::types::{Attribute, DerivationMeta, InvalidMeta, System};

/// The evaluation expression, materialised into the review directory.
const EVAL_ATTRS_NIX: &str = include_str!("../../nix/evalAttrs.nix");

/// Errors from evaluator dispatch. All fatal: a missing per-system
/// attribute map would make the review incomplete.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("evaluator failed for {system}: {details}")]
    EvaluatorFailed { system: System, details: String },

    #[error("evaluator output violates the result schema: {0}")]
    Schema(#[from] InvalidMeta),

    #[error("evaluator produced malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One evaluated attribute, with aliases folded onto the canonical name.
#[derive(Debug, Clone)]
pub struct EvaluatedAttr {
    pub attr: Attribute,
    pub meta: DerivationMeta,
    /// Other candidate attributes that resolved to the same out path.
    pub aliases: Vec<Attribute>,
}

/// Paths and knobs shared by every evaluator invocation of a run.
#[derive(Debug, Clone)]
pub struct EvalContext {
    /// The merged worktree containing the package set under review.
    pub nixpkgs_path: PathBuf,
    /// The materialised nixpkgs config expression.
    pub nixpkgs_config_path: PathBuf,
    /// Scratch directory for expression and attr files.
    pub scratch_dir: PathBuf,
    pub include_passthru_tests: bool,
    /// Evaluation shards run concurrently.
    pub parallelism: usize,
}

impl EvalContext {
    /// Writes `evalAttrs.nix` into the scratch directory, once per run.
    pub fn eval_expr_path(&self) -> Result<PathBuf, EvalError> {
        let path = self.scratch_dir.join("evalAttrs.nix");
        if !path.exists() {
            std::fs::write(&path, EVAL_ATTRS_NIX)?;
        }
        Ok(path)
    }
}

/// Runs one evaluator invocation over `attrs` for `system`.
///
/// The returned map is strictly validated: every entry satisfies the
/// [`DerivationMeta`] invariants or the whole call fails.
pub async fn eval_attrs_raw(
    ctx: &EvalContext,
    system: &System,
    attrs: &BTreeSet<Attribute>,
    include_tests: bool,
) -> Result<BTreeMap<Attribute, DerivationMeta>, EvalError> {
    if attrs.is_empty() {
        return Ok(BTreeMap::new());
    }

    let expr_path = ctx.eval_expr_path()?;
    let names: Vec<&str> = attrs.iter().map(Attribute::as_str).collect();
    let mut attr_json = tempfile::Builder::new()
        .prefix("attrs-")
        .suffix(".json")
        .tempfile_in(&ctx.scratch_dir)?;
    attr_json.write_all(serde_json::to_string(&names)?.as_bytes())?;
    attr_json.flush()?;

    let expr = format!(
        "import {expr} {{ attr-json = {json}; nixpkgs-path = {nixpkgs}; \
         nixpkgs-config-path = {config}; system = \"{system}\"; \
         include-passthru-tests = {tests}; }}",
        expr = expr_path.display(),
        json = attr_json.path().display(),
        nixpkgs = ctx.nixpkgs_path.display(),
        config = ctx.nixpkgs_config_path.display(),
        tests = include_tests,
    );
    let args: Vec<String> = [
        "--extra-experimental-features",
        "nix-command",
        "eval",
        "--json",
        "--show-trace",
        "--expr",
        &expr,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let output = process::run("nix", &args, RunOptions::default()).await?;
    if !output.success() {
        return Err(EvalError::EvaluatorFailed {
            system: system.clone(),
            details: last_lines(&output.stderr, 10),
        });
    }

    let raw: BTreeMap<String, DerivationMeta> = serde_json::from_str(&output.stdout)?;
    let mut result = BTreeMap::new();
    for (name, meta) in raw {
        let attr = Attribute::parse(&name).map_err(|e| InvalidMeta {
            attr: name.clone(),
            reason: e.to_string(),
        })?;
        meta.validate(&attr)?;
        result.insert(attr, meta);
    }
    Ok(result)
}

/// Evaluates the candidate set for every requested system concurrently,
/// folding aliases by out path.
pub async fn evaluate_systems(
    ctx: &EvalContext,
    attrs_per_system: &BTreeMap<System, BTreeSet<Attribute>>,
) -> Result<BTreeMap<System, Vec<EvaluatedAttr>>, EvalError> {
    let semaphore = Arc::new(Semaphore::new(ctx.parallelism.max(1)));
    let mut tasks: JoinSet<Result<(System, Vec<EvaluatedAttr>), EvalError>> = JoinSet::new();

    for (system, attrs) in attrs_per_system {
        let ctx = ctx.clone();
        let system = system.clone();
        let attrs = attrs.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            let raw =
                eval_attrs_raw(&ctx, &system, &attrs, ctx.include_passthru_tests).await?;
            Ok((system, fold_aliases(raw)))
        });
    }

    let mut result = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        let (system, attrs) = joined.expect("eval task not cancelled")?;
        result.insert(system, attrs);
    }
    Ok(result)
}

/// Folds attributes that share an out path into one entry.
///
/// When two names resolve to the same store path the shorter one is the
/// canonical attribute and the longer becomes an alias, so an aliased
/// package is only built and reported once.
pub fn fold_aliases(raw: BTreeMap<Attribute, DerivationMeta>) -> Vec<EvaluatedAttr> {
    let mut by_path: BTreeMap<PathBuf, EvaluatedAttr> = BTreeMap::new();
    let mut pathless: Vec<EvaluatedAttr> = Vec::new();

    for (attr, meta) in raw {
        let entry = EvaluatedAttr {
            attr,
            meta,
            aliases: Vec::new(),
        };
        let Some(path) = entry.meta.first_out_path().cloned() else {
            pathless.push(entry);
            continue;
        };
        match by_path.get_mut(&path) {
            None => {
                by_path.insert(path, entry);
            }
            Some(existing) => {
                if entry.attr.as_str().len() < existing.attr.as_str().len() {
                    let mut replacement = entry;
                    replacement.aliases.push(existing.attr.clone());
                    replacement.aliases.append(&mut existing.aliases);
                    replacement.aliases.sort();
                    *existing = replacement;
                } else {
                    existing.aliases.push(entry.attr);
                    existing.aliases.sort();
                }
            }
        }
    }

    let mut out: Vec<EvaluatedAttr> = by_path.into_values().chain(pathless).collect();
    out.sort_by(|a, b| a.attr.cmp(&b.attr));
    out
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
