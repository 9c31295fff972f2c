//! Local two-pass evaluation for computing rebuilds.
//!
//! The attribute tree is evaluated once in the base worktree and once in
//! the merged worktree, producing `attribute -> drvPath` tables. An
//! attribute is a rebuild candidate when it is absent in the base table
//! or its derivation path differs. Evaluation is sharded into chunks to
//! bound tail latency; a chunk that fails to evaluate is retried once
//! with halved subchunks, and attrs of persistently failing chunks stay
//! in the candidate set so the dispatcher classifies them (typically
//! `Broken`).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::eval::{EvalContext, EvalError, eval_attrs_raw};
use crate::process::{self, RunOptions};
use crate::types::{Attribute, System};

/// `attribute -> drvPath` for one tree; broken attributes map to `None`.
pub type TreeOutputs = BTreeMap<Attribute, Option<String>>;

/// Enumerates the top-level attribute names of the package set.
pub async fn list_attr_names(
    ctx: &EvalContext,
    system: &System,
) -> Result<Vec<Attribute>, EvalError> {
    let expr = format!(
        "builtins.attrNames (import {nixpkgs} {{ system = \"{system}\"; \
         config = import {config}; overlays = [ ]; }})",
        nixpkgs = ctx.nixpkgs_path.display(),
        config = ctx.nixpkgs_config_path.display(),
    );
    let args: Vec<String> = [
        "--extra-experimental-features",
        "nix-command",
        "eval",
        "--json",
        "--expr",
        &expr,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let output = process::run("nix", &args, RunOptions::default()).await?;
    if !output.success() {
        let lines: Vec<&str> = output.stderr.lines().collect();
        let start = lines.len().saturating_sub(10);
        return Err(EvalError::EvaluatorFailed {
            system: system.clone(),
            details: lines[start..].join("\n"),
        });
    }
    let names: Vec<String> = serde_json::from_str(&output.stdout)?;
    Ok(names
        .into_iter()
        .filter_map(|n| Attribute::parse(n).ok())
        .collect())
}

/// Evaluates `attribute -> drvPath` for the whole tree, sharded.
///
/// `chunk_count` is normally 4x the CPU count; chunks run concurrently
/// under the context's semaphore.
pub async fn tree_outputs(
    ctx: &EvalContext,
    system: &System,
    names: Vec<Attribute>,
    chunk_count: usize,
) -> Result<TreeOutputs, EvalError> {
    let chunk_size = names.len().div_ceil(chunk_count.max(1)).max(1);
    let chunks: Vec<BTreeSet<Attribute>> = names
        .chunks(chunk_size)
        .map(|c| c.iter().cloned().collect())
        .collect();

    let semaphore = Arc::new(Semaphore::new(ctx.parallelism.max(1)));
    let mut tasks: JoinSet<TreeOutputs> = JoinSet::new();
    for chunk in chunks {
        let ctx = ctx.clone();
        let system = system.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            eval_chunk_with_retry(&ctx, &system, chunk).await
        });
    }

    let mut outputs = TreeOutputs::new();
    while let Some(joined) = tasks.join_next().await {
        outputs.append(&mut joined.expect("eval task not cancelled"));
    }
    Ok(outputs)
}

/// Evaluates one chunk; on failure splits it in half and retries each
/// half once. Attrs of a half that still fails map to `None` so they
/// surface as candidates and classify downstream.
async fn eval_chunk_with_retry(
    ctx: &EvalContext,
    system: &System,
    chunk: BTreeSet<Attribute>,
) -> TreeOutputs {
    match eval_chunk(ctx, system, &chunk).await {
        Ok(outputs) => outputs,
        Err(err) => {
            tracing::warn!(%err, size = chunk.len(), "eval chunk failed, halving");
            let attrs: Vec<Attribute> = chunk.into_iter().collect();
            let mid = attrs.len().div_ceil(2);
            let mut outputs = TreeOutputs::new();
            for half in [&attrs[..mid], &attrs[mid..]] {
                if half.is_empty() {
                    continue;
                }
                let half_set: BTreeSet<Attribute> = half.iter().cloned().collect();
                match eval_chunk(ctx, system, &half_set).await {
                    Ok(mut half_outputs) => outputs.append(&mut half_outputs),
                    Err(err) => {
                        tracing::warn!(%err, size = half.len(), "eval subchunk failed");
                        for attr in half {
                            outputs.insert(attr.clone(), None);
                        }
                    }
                }
            }
            outputs
        }
    }
}

async fn eval_chunk(
    ctx: &EvalContext,
    system: &System,
    chunk: &BTreeSet<Attribute>,
) -> Result<TreeOutputs, EvalError> {
    let raw = eval_attrs_raw(ctx, system, chunk, false).await?;
    Ok(raw
        .into_iter()
        .map(|(attr, meta)| (attr, meta.drv_path))
        .collect())
}

/// The rebuild candidates: attributes new in the merged tree or whose
/// derivation path changed.
pub fn diff_trees(base: &TreeOutputs, merged: &TreeOutputs) -> BTreeSet<Attribute> {
    merged
        .iter()
        .filter(|(attr, drv)| match base.get(*attr) {
            None => true,
            Some(base_drv) => base_drv != *drv,
        })
        .map(|(attr, _)| attr.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(s: &str) -> Attribute {
        Attribute::parse(s).unwrap()
    }

    #[test]
    fn diff_detects_new_attribute() {
        let base = TreeOutputs::new();
        let merged = TreeOutputs::from([(attr("new"), Some("/nix/store/new.drv".into()))]);
        assert_eq!(diff_trees(&base, &merged), BTreeSet::from([attr("new")]));
    }

    #[test]
    fn diff_detects_changed_drv_path() {
        let base = TreeOutputs::from([
            (attr("changed"), Some("/nix/store/old.drv".into())),
            (attr("same"), Some("/nix/store/same.drv".into())),
        ]);
        let merged = TreeOutputs::from([
            (attr("changed"), Some("/nix/store/new.drv".into())),
            (attr("same"), Some("/nix/store/same.drv".into())),
        ]);
        assert_eq!(diff_trees(&base, &merged), BTreeSet::from([attr("changed")]));
    }

    #[test]
    fn diff_ignores_removed_attributes() {
        let base = TreeOutputs::from([(attr("removed"), Some("/nix/store/x.drv".into()))]);
        let merged = TreeOutputs::new();
        assert!(diff_trees(&base, &merged).is_empty());
    }

    #[test]
    fn diff_flags_newly_broken_attribute() {
        let base = TreeOutputs::from([(attr("pkg"), Some("/nix/store/x.drv".into()))]);
        let merged = TreeOutputs::from([(attr("pkg"), None)]);
        assert_eq!(diff_trees(&base, &merged), BTreeSet::from([attr("pkg")]));
    }
}
