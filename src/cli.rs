//! Command-line surface.
//!
//! Thin mapping from flags onto the typed [`Config`] record; anything
//! clap cannot interpret is a usage error (exit code 2).

use clap::{Args, Parser, Subcommand};
use regex::Regex;

use crate::config::{BuildGraph, Checkout, Config, EvalMode};
use crate::errors::Error;
use crate::types::{Attribute, PrNumber, current_system_name, expand_system_aliases};

#[derive(Debug, Parser)]
#[command(
    name = "nixpkgs-review",
    version,
    about = "Review pull requests and local changes to nixpkgs by building what they rebuild"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Review one or more pull requests
    Pr {
        /// Pull request numbers
        #[arg(required = true)]
        numbers: Vec<u64>,

        /// Source of the candidate attribute list
        #[arg(long, default_value = "auto", value_parser = ["auto", "ofborg", "local"])]
        eval: String,

        /// What to check out when building: merge the PR into its target
        /// branch, or build the head commit as the author committed it
        #[arg(short, long, default_value = "merge", value_parser = ["merge", "commit"])]
        checkout: String,

        /// Post the review result as a PR comment
        #[arg(long)]
        post_result: bool,

        /// Approve the PR after a successful run
        #[arg(long)]
        approve: bool,

        /// Merge the PR after a successful run (requires access)
        #[arg(long)]
        merge: bool,

        #[command(flatten)]
        common: CommonFlags,
    },

    /// Review a commit in the local repository
    Rev {
        /// Commit, tag, ref or branch to review
        commit: String,

        #[command(flatten)]
        common: CommonFlags,
    },

    /// Review the uncommitted changes in the working tree
    Wip {
        /// Review only staged changes
        #[arg(short, long)]
        staged: bool,

        #[command(flatten)]
        common: CommonFlags,
    },

    /// Approve a pull request
    Approve {
        /// Pull request number
        number: u64,
    },

    /// Merge a pull request
    Merge {
        /// Pull request number
        number: u64,
    },

    /// Post a previously generated report as a PR comment
    PostResult {
        /// Pull request number
        number: u64,
    },

    /// Show the comments on a pull request
    Comments {
        /// Pull request number
        number: u64,
    },
}

#[derive(Debug, Args)]
pub struct CommonFlags {
    /// Systems to review: concrete triples or the aliases
    /// current/all/linux/darwin/x64/aarch64 (space-separated)
    #[arg(long, default_value = "current")]
    pub systems: String,

    /// Package to build (can be passed multiple times)
    #[arg(short, long = "package")]
    pub package: Vec<String>,

    /// Regular expression packages have to match (search semantics)
    #[arg(long = "package-regex")]
    pub package_regex: Vec<String>,

    /// Package not to build (can be passed multiple times)
    #[arg(long = "skip-package")]
    pub skip_package: Vec<String>,

    /// Regular expression of packages not to build (full match)
    #[arg(long = "skip-package-regex")]
    pub skip_package_regex: Vec<String>,

    /// Arguments passed verbatim to the builder
    #[arg(long = "build-args", allow_hyphen_values = true)]
    pub build_args: Vec<String>,

    /// Frontend rendering build output
    #[arg(long, default_value = "nom", value_parser = ["nom", "nix"])]
    pub build_graph: String,

    /// Only evaluate and build, do not start a shell
    #[arg(long)]
    pub no_shell: bool,

    /// Run a single command in the shell instead of an interactive session
    #[arg(long)]
    pub run: Option<String>,

    /// Print the markdown report to stdout
    #[arg(long)]
    pub print_result: bool,

    /// Wrap the shell in a sandbox
    #[arg(long)]
    pub sandbox: bool,

    /// Remote repository URL for ref fetches
    #[arg(long, default_value = "https://github.com/NixOS/nixpkgs")]
    pub remote: String,

    /// Extra nixpkgs config expression, e.g. '{ cudaSupport = true; }'
    #[arg(long)]
    pub extra_nixpkgs_config: Option<String>,

    /// GitHub API token (defaults to GITHUB_TOKEN / GITHUB_TOKEN_CMD)
    #[arg(long)]
    pub token: Option<String>,

    /// Also build passthru.tests of the changed packages
    #[arg(long = "tests")]
    pub include_passthru_tests: bool,

    /// Allow deprecated alias attribute paths
    #[arg(long)]
    pub allow_aliases: bool,

    /// In-flight build cap (defaults to the CPU count)
    #[arg(long)]
    pub max_jobs: Option<usize>,
}

impl CommonFlags {
    /// Maps the flags onto the typed config record.
    pub fn to_config(&self) -> Result<Config, Error> {
        let mut config = Config::default();

        let current = current_system_name();
        for word in self.systems.split_whitespace() {
            config
                .systems
                .extend(expand_system_aliases(word, &current));
        }

        for name in &self.package {
            config.package.insert(parse_attr(name)?);
        }
        for name in &self.skip_package {
            config.skip_package.insert(parse_attr(name)?);
        }
        config.package_regex = parse_regexes(&self.package_regex)?;
        config.skip_package_regex = parse_regexes(&self.skip_package_regex)?;

        config.build_args = self
            .build_args
            .iter()
            .flat_map(|s| s.split_whitespace())
            .map(str::to_string)
            .collect();
        config.build_graph = self.build_graph.parse::<BuildGraph>()?;
        config.no_shell = self.no_shell;
        config.run_command = self.run.clone();
        config.print_result = self.print_result;
        config.sandbox = self.sandbox;
        config.remote = self.remote.clone();
        config.extra_nixpkgs_config = self.extra_nixpkgs_config.clone();
        config.token = self.token.clone();
        config.include_passthru_tests = self.include_passthru_tests;
        config.allow_aliases = self.allow_aliases;
        if let Some(max_jobs) = self.max_jobs {
            config.max_jobs = max_jobs;
        }

        config.resolve_token()?;
        config.validate()?;
        Ok(config)
    }
}

/// Applies the pr-subcommand-only flags on top of the common config.
pub fn apply_pr_flags(
    config: &mut Config,
    eval: &str,
    checkout: &str,
    post_result: bool,
    approve: bool,
    merge: bool,
) -> Result<(), Error> {
    config.eval = eval.parse::<EvalMode>()?;
    config.checkout = checkout.parse::<Checkout>()?;
    config.post_result = post_result;
    config.approve = approve;
    config.merge = merge;
    Ok(())
}

pub fn pr_numbers(numbers: &[u64]) -> Vec<PrNumber> {
    numbers.iter().copied().map(PrNumber).collect()
}

fn parse_attr(name: &str) -> Result<Attribute, Error> {
    Attribute::parse(name).map_err(|e| Error::Usage(e.to_string()))
}

fn parse_regexes(patterns: &[String]) -> Result<Vec<Regex>, Error> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| Error::Usage(format!("'{p}' is not a valid regex: {e}"))))
        .collect()
}
