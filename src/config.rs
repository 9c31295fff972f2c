//! Runtime configuration for a review run.
//!
//! Every recognised option is a typed field with enumerated variants;
//! anything the CLI layer cannot map onto this record is a usage error.

use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use regex::Regex;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::errors::Error;
use crate::types::{Attribute, System};

/// How the head of a PR is materialised for review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Checkout {
    /// Merge the pull request into the target branch.
    #[default]
    Merge,
    /// Check out the head commit as the author committed it.
    Commit,
}

impl FromStr for Checkout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "merge" => Ok(Checkout::Merge),
            "commit" => Ok(Checkout::Commit),
            other => Err(Error::Usage(format!("unknown checkout option: {other}"))),
        }
    }
}

impl fmt::Display for Checkout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkout::Merge => write!(f, "merge"),
            Checkout::Commit => write!(f, "commit"),
        }
    }
}

/// Where the candidate attribute list comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvalMode {
    /// Use CI artifacts when fresh, fall back to local evaluation.
    #[default]
    Auto,
    /// Require the CI evaluator's artifacts; fail when unavailable.
    Ofborg,
    /// Always evaluate locally.
    Local,
}

impl FromStr for EvalMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "auto" => Ok(EvalMode::Auto),
            "ofborg" => Ok(EvalMode::Ofborg),
            "local" => Ok(EvalMode::Local),
            other => Err(Error::Usage(format!("unknown eval mode: {other}"))),
        }
    }
}

/// Which frontend renders build output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildGraph {
    /// Funnel output through `nom` when it is on $PATH.
    #[default]
    Nom,
    /// Plain `nix` output.
    Nix,
}

impl FromStr for BuildGraph {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "nom" => Ok(BuildGraph::Nom),
            "nix" => Ok(BuildGraph::Nix),
            other => Err(Error::Usage(format!("unknown build graph: {other}"))),
        }
    }
}

/// The full configuration of one review run.
#[derive(Debug)]
pub struct Config {
    pub checkout: Checkout,
    pub eval: EvalMode,
    /// Concrete systems after alias expansion; never empty.
    pub systems: BTreeSet<System>,
    /// Include set; when non-empty the candidate set is restricted to it
    /// plus `package_regex` matches.
    pub package: BTreeSet<Attribute>,
    pub package_regex: Vec<Regex>,
    pub skip_package: BTreeSet<Attribute>,
    pub skip_package_regex: Vec<Regex>,
    pub post_result: bool,
    pub print_result: bool,
    pub approve: bool,
    pub merge: bool,
    pub no_shell: bool,
    pub run_command: Option<String>,
    /// Extra arguments appended verbatim to the builder invocation.
    pub build_args: Vec<String>,
    pub build_graph: BuildGraph,
    pub sandbox: bool,
    /// Remote repository URL for ref fetches.
    pub remote: String,
    /// Extra nixpkgs config expression, `{ ... }`.
    pub extra_nixpkgs_config: Option<String>,
    pub token: Option<String>,
    pub include_passthru_tests: bool,
    pub allow_aliases: bool,
    /// Builder parallelism; defaults to the CPU count.
    pub max_jobs: usize,
    /// Evaluation shards run concurrently; defaults to 4x the CPU count.
    pub eval_parallelism: usize,
}

impl Default for Config {
    fn default() -> Self {
        let cpus = available_cpus();
        Config {
            checkout: Checkout::default(),
            eval: EvalMode::default(),
            systems: BTreeSet::new(),
            package: BTreeSet::new(),
            package_regex: Vec::new(),
            skip_package: BTreeSet::new(),
            skip_package_regex: Vec::new(),
            post_result: false,
            print_result: false,
            approve: false,
            merge: false,
            no_shell: false,
            run_command: None,
            build_args: Vec::new(),
            build_graph: BuildGraph::default(),
            sandbox: false,
            remote: "https://github.com/NixOS/nixpkgs".to_string(),
            extra_nixpkgs_config: None,
            token: None,
            include_passthru_tests: false,
            allow_aliases: false,
            max_jobs: cpus,
            eval_parallelism: cpus * 4,
        }
    }
}

impl Config {
    /// Resolves the API token from the configured value or the
    /// environment: `GITHUB_TOKEN`, then `GITHUB_TOKEN_CMD` (a shell
    /// command whose stdout is the token).
    pub fn resolve_token(&mut self) -> Result<(), Error> {
        if self.token.is_some() {
            return Ok(());
        }
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            if !token.trim().is_empty() {
                self.token = Some(token.trim().to_string());
            }
            return Ok(());
        }
        if let Ok(cmd) = std::env::var("GITHUB_TOKEN_CMD") {
            let output = Command::new("sh")
                .arg("-c")
                .arg(&cmd)
                .output()
                .map_err(|e| Error::Usage(format!("GITHUB_TOKEN_CMD failed to start: {e}")))?;
            if !output.status.success() {
                return Err(Error::Usage(format!(
                    "GITHUB_TOKEN_CMD exited with {}",
                    output.status
                )));
            }
            let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if token.is_empty() {
                return Err(Error::Usage("GITHUB_TOKEN_CMD produced no output".into()));
            }
            self.token = Some(token);
        }
        Ok(())
    }

    /// Validates the extra nixpkgs config shape (`{ ... }`).
    pub fn validate(&self) -> Result<(), Error> {
        if self.systems.is_empty() {
            return Err(Error::Usage("no systems selected".into()));
        }
        if let Some(cfg) = &self.extra_nixpkgs_config {
            let trimmed = cfg.trim();
            if !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
                return Err(Error::Usage(
                    "--extra-nixpkgs-config must start with `{` and end with `}`".into(),
                ));
            }
        }
        Ok(())
    }

    /// The nixpkgs config expression used by every evaluation and build.
    pub fn nixpkgs_config_content(&self) -> String {
        let aliases = if self.allow_aliases {
            ""
        } else {
            "  allowAliases = false;\n"
        };
        let extra = self.extra_nixpkgs_config.as_deref().unwrap_or("{ }");
        format!(
            "{{\n  allowUnfree = true;\n  allowBroken = false;\n  checkMeta = true;\n{aliases}}} // {extra}\n"
        )
    }

    /// Materialises the nixpkgs config expression into a scratch file.
    pub fn write_nixpkgs_config(&self) -> std::io::Result<NamedTempFile> {
        let mut file = tempfile::Builder::new().suffix(".nix").tempfile()?;
        file.write_all(self.nixpkgs_config_content().as_bytes())?;
        file.flush()?;
        Ok(file)
    }
}

/// CPU count with a floor of one.
pub fn available_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// The cache root: `$NIXPKGS_REVIEW_CACHE_DIR`, `$XDG_CACHE_HOME`, or
/// `$HOME/.cache`, each suffixed with `nixpkgs-review`.
pub fn cache_root() -> Result<PathBuf, Error> {
    let base = if let Ok(dir) = std::env::var("NIXPKGS_REVIEW_CACHE_DIR") {
        PathBuf::from(dir)
    } else if let Ok(dir) = std::env::var("XDG_CACHE_HOME") {
        PathBuf::from(dir)
    } else if let Ok(home) = std::env::var("HOME") {
        Path::new(&home).join(".cache")
    } else {
        return Err(Error::Usage(
            "cannot determine a cache directory: set XDG_CACHE_HOME or HOME".into(),
        ));
    };
    Ok(base.join("nixpkgs-review"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_parses_known_variants() {
        assert_eq!("merge".parse::<Checkout>().unwrap(), Checkout::Merge);
        assert_eq!("commit".parse::<Checkout>().unwrap(), Checkout::Commit);
        assert!("rebase".parse::<Checkout>().is_err());
    }

    #[test]
    fn eval_mode_rejects_unknown() {
        assert!("hydra".parse::<EvalMode>().is_err());
        assert_eq!("ofborg".parse::<EvalMode>().unwrap(), EvalMode::Ofborg);
    }

    #[test]
    fn validate_requires_systems() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_malformed_extra_config() {
        let mut config = Config::default();
        config.systems.insert(System::new("x86_64-linux"));
        config.extra_nixpkgs_config = Some("allowUnfree = true;".into());
        assert!(config.validate().is_err());

        config.extra_nixpkgs_config = Some("{ cudaSupport = true; }".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn nixpkgs_config_disables_aliases_by_default() {
        let config = Config::default();
        let file = config.write_nixpkgs_config().unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(content.contains("allowAliases = false;"));
        assert!(content.contains("allowUnfree = true;"));
        assert!(content.contains("checkMeta = true;"));
        assert!(content.ends_with("// { }\n"));
    }

    #[test]
    fn nixpkgs_config_honors_alias_override() {
        let config = Config {
            allow_aliases: true,
            extra_nixpkgs_config: Some("{ cudaSupport = true; }".into()),
            ..Config::default()
        };
        let file = config.write_nixpkgs_config().unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(!content.contains("allowAliases"));
        assert!(content.contains("// { cudaSupport = true; }"));
    }
}
