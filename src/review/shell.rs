//! Hand the built packages to an interactive shell.
//!
//! The shell launcher generates `attrs.nix` listing the built attributes
//! per system and execs `{nix,nom}-shell` on the crate's review shell
//! expression. `--run CMD` executes a single command instead of an
//! interactive session.

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::BuildGraph;
use crate::errors::Error;
use crate::process::{self, RunOptions};
use crate::types::{Attribute, System};

const REVIEW_SHELL_NIX: &str = include_str!("../../nix/review-shell.nix");

/// Writes the per-system attribute list consumed by the shell expression.
pub fn write_attrs_file(
    path: &Path,
    attrs_per_system: &BTreeMap<System, Vec<Attribute>>,
) -> std::io::Result<()> {
    let mut content = String::from("{\n");
    for (system, attrs) in attrs_per_system {
        content.push_str(&format!("  \"{system}\" = [\n"));
        for attr in attrs {
            content.push_str(&format!("    \"{attr}\"\n"));
        }
        content.push_str("  ];\n");
    }
    content.push('}');
    std::fs::write(path, content)
}

/// Launches the shell over the built packages.
///
/// Returns the shell's exit code; a missing shell binary is a spawn
/// error, not a review failure.
pub async fn launch_shell(
    cache_dir: &Path,
    attrs_path: &Path,
    nixpkgs_path: &Path,
    nixpkgs_config_path: &Path,
    local_system: &System,
    build_graph: BuildGraph,
    run_command: Option<&str>,
) -> Result<i32, Error> {
    let shell_expr = cache_dir.join("review-shell.nix");
    if !shell_expr.exists() {
        std::fs::write(&shell_expr, REVIEW_SHELL_NIX)?;
    }

    let shell_binary = match build_graph {
        BuildGraph::Nom if binary_on_path("nom-shell") => "nom-shell",
        _ => "nix-shell",
    };

    let mut args: Vec<String> = vec![
        "--argstr".into(),
        "local-system".into(),
        local_system.to_string(),
        "--argstr".into(),
        "nixpkgs-path".into(),
        nixpkgs_path.display().to_string(),
        "--argstr".into(),
        "nixpkgs-config-path".into(),
        nixpkgs_config_path.display().to_string(),
        "--argstr".into(),
        "attrs-path".into(),
        attrs_path.display().to_string(),
        shell_expr.display().to_string(),
    ];
    if let Some(cmd) = run_command {
        args.push("--run".into());
        args.push(cmd.to_string());
    }

    let output = process::run(
        shell_binary,
        &args,
        RunOptions {
            cwd: Some(cache_dir.to_path_buf()),
            ..RunOptions::default()
        },
    )
    .await?;
    Ok(output.code)
}

fn binary_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(name).is_file())
}
