//! Markdown rendering of the review result.
//!
//! The layout follows the conventions reviewers expect on nixpkgs PRs:
//! collapsible sections per category, optional failure-log tails, and a
//! reviewed-points checklist. Single-system reports collapse the system
//! axis. The whole document stays within GitHub's comment size limit.

use std::collections::{BTreeMap, HashSet};

use crate::types::{Outcome, System};

use super::logs::{TAIL_LINES, log_tail, strip_ansi};
use super::{ClassifiedAttr, ReportContext, SystemReport};

/// GitHub's comment size limit.
const MAX_COMMENT_LENGTH: usize = 65536;

const TRUNCATION_NOTICE: &str =
    "\n---\nWARNING: Some logs were not included in this report: there were too many.";

pub(super) fn render(
    context: &ReportContext,
    systems: &[System],
    reports: &BTreeMap<System, SystemReport>,
) -> String {
    let mut msg = String::new();
    msg.push_str("## `nixpkgs-review` result\n\n");
    msg.push_str("Generated using [`nixpkgs-review`](https://github.com/nix-community/nixpkgs-review).\n\n");
    msg.push_str(&format!("Command: `{}`\n", command_echo(context)));
    if let Some(commit) = &context.commit {
        msg.push_str(&format!("Commit: `{commit}`\n"));
    }
    if context.incomplete {
        msg.push_str("\n**Note:** the review was interrupted; results are incomplete.\n");
    }

    let single_system = systems.len() == 1;
    for system in systems {
        let report = &reports[system];
        msg.push_str("\n---\n");
        if !single_system {
            msg.push_str(&format!("### `{system}`\n"));
        }
        msg.push_str(&section(
            ":fast_forward:",
            report.of(Outcome::Broken),
            "marked as broken and skipped",
            "package",
        ));
        msg.push_str(&section(
            ":fast_forward:",
            report.of(Outcome::NonExistent),
            "present in the candidate set, but not found in the checkout",
            "package",
        ));
        msg.push_str(&section(
            ":fast_forward:",
            report.of(Outcome::Blacklisted),
            "blacklisted",
            "package",
        ));
        msg.push_str(&section(
            ":x:",
            report.of(Outcome::Failed),
            "failed to build",
            "package",
        ));
        msg.push_str(&section(
            ":white_check_mark:",
            report.of(Outcome::Test),
            "built",
            "test",
        ));
        msg.push_str(&section(
            ":white_check_mark:",
            report.of(Outcome::Built),
            "built",
            "package",
        ));
    }

    if context.show_logs {
        msg = append_log_sections(msg, systems, reports);
    }

    msg.push_str(&reviewed_points());
    msg
}

/// The equivalent command line, echoed for reproducibility.
fn command_echo(context: &ReportContext) -> String {
    let mut cmd = String::from("nixpkgs-review");
    if let Some(pr) = context.pr {
        cmd.push_str(&format!(" pr {pr}"));
    }
    if let Some(config) = &context.extra_nixpkgs_config {
        cmd.push_str(&format!(" --extra-nixpkgs-config '{config}'"));
    }
    if context.checkout != "merge" {
        cmd.push_str(&format!(" --checkout {}", context.checkout));
    }
    for (flag, values) in [
        ("package", &context.only_packages),
        ("package-regex", &context.package_regex),
        ("skip-package", &context.skip_packages),
        ("skip-package-regex", &context.skip_packages_regex),
    ] {
        for value in values {
            cmd.push_str(&format!(" --{flag} {value}"));
        }
    }
    cmd
}

/// One collapsible category section; empty categories render nothing.
fn section(emoji: &str, packages: &[ClassifiedAttr], msg: &str, what: &str) -> String {
    if packages.is_empty() {
        return String::new();
    }
    let plural = if packages.len() == 1 { "" } else { "s" };
    let mut res = String::from("<details>\n");
    res.push_str(&format!(
        "  <summary>{emoji} {} {what}{plural} {msg}:</summary>\n  <ul>\n",
        packages.len()
    ));
    for pkg in packages {
        res.push_str(&format!("    <li>{}", pkg.attr));
        if !pkg.aliases.is_empty() {
            let aliases: Vec<String> = pkg.aliases.iter().map(|a| a.to_string()).collect();
            res.push_str(&format!(" ({})", aliases.join(", ")));
        }
        res.push_str("</li>\n");
    }
    res.push_str("  </ul>\n</details>\n");
    res
}

/// Appends failure-log tails per system while the document fits into a
/// single GitHub comment. Identical tails are embedded once.
fn append_log_sections(
    mut msg: String,
    systems: &[System],
    reports: &BTreeMap<System, SystemReport>,
) -> String {
    for system in systems {
        let failed = reports[system].of(Outcome::Failed);
        if failed.is_empty() {
            continue;
        }
        let section = log_section(system, failed);
        if section.is_empty() {
            continue;
        }
        if msg.len() + section.len() > MAX_COMMENT_LENGTH - TRUNCATION_NOTICE.len() {
            msg.push_str(TRUNCATION_NOTICE);
            break;
        }
        msg.push_str(&section);
    }
    msg
}

fn log_section(system: &System, failed: &[ClassifiedAttr]) -> String {
    let mut res = String::new();
    let mut seen_tails: HashSet<String> = HashSet::new();
    for pkg in failed {
        let Some(log_path) = &pkg.log_path else {
            continue;
        };
        let tail = html_escape(&strip_ansi(&log_tail(log_path, TAIL_LINES)));
        if tail.is_empty() || !seen_tails.insert(tail.clone()) {
            continue;
        }
        if res.is_empty() {
            res.push_str("\n---\n");
            res.push_str(&format!(
                "<details>\n<summary>Error logs: `{system}`</summary>\n"
            ));
        }
        res.push_str(&format!(
            "<details>\n<summary>{}</summary>\n<pre>{tail}</pre>\n</details>\n",
            pkg.attr
        ));
    }
    if !res.is_empty() {
        res.push_str("</details>\n");
    }
    res
}

fn reviewed_points() -> String {
    let mut res = String::from("\n---\n<details>\n<summary>Reviewed points</summary>\n\n");
    for point in [
        "package name fits guidelines",
        "package version fits guidelines",
        "package builds on the reviewed platforms",
        "executables tested on the reviewed platforms",
        "meta fields are accurate",
    ] {
        res.push_str(&format!("- [ ] {point}\n"));
    }
    res.push_str("</details>\n");
    res
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
