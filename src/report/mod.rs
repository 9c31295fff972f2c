//! Result aggregation: merge per-system outcomes into the report.
//!
//! The aggregator owns the final shape of a review: the six-way partition
//! per system, `report.json`, `report.md` and the `results/` symlink
//! tree. All lists are sorted before writing so reruns on identical
//! inputs produce identical reports.

mod logs;
mod markdown;

pub use logs::{log_tail, strip_ansi};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::json;

use crate::types::{Attribute, Outcome, System, sort_systems};

/// One fully classified (attribute, system) entry.
#[derive(Debug, Clone)]
pub struct ClassifiedAttr {
    pub attr: Attribute,
    pub outcome: Outcome,
    /// Other attribute names folded onto this one.
    pub aliases: Vec<Attribute>,
    /// First output path, for `results/` links.
    pub out_path: Option<PathBuf>,
    /// Build log, when one was captured.
    pub log_path: Option<PathBuf>,
}

/// The six disjoint outcome lists for one system.
#[derive(Debug, Default)]
pub struct SystemReport {
    entries: BTreeMap<Outcome, Vec<ClassifiedAttr>>,
}

impl SystemReport {
    pub fn new(mut attrs: Vec<ClassifiedAttr>) -> Self {
        attrs.sort_by(|a, b| a.attr.cmp(&b.attr));
        attrs.dedup_by(|a, b| a.attr == b.attr);
        let mut entries: BTreeMap<Outcome, Vec<ClassifiedAttr>> = BTreeMap::new();
        for outcome in Outcome::ALL {
            entries.insert(outcome, Vec::new());
        }
        for entry in attrs {
            entries
                .get_mut(&entry.outcome)
                .expect("all outcomes preseeded")
                .push(entry);
        }
        SystemReport { entries }
    }

    pub fn of(&self, outcome: Outcome) -> &[ClassifiedAttr] {
        self.entries.get(&outcome).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn names(&self, outcome: Outcome) -> Vec<String> {
        self.of(outcome).iter().map(|e| e.attr.to_string()).collect()
    }

    /// A run succeeds when nothing failed to build.
    pub fn succeeded(&self) -> bool {
        self.of(Outcome::Failed).is_empty()
    }
}

/// Configuration echoed into the report header and `report.json`.
#[derive(Debug, Default)]
pub struct ReportContext {
    pub pr: Option<u64>,
    pub commit: Option<String>,
    pub checkout: String,
    pub extra_nixpkgs_config: Option<String>,
    pub only_packages: Vec<String>,
    pub package_regex: Vec<String>,
    pub skip_packages: Vec<String>,
    pub skip_packages_regex: Vec<String>,
    /// Set when the run was cancelled before all builds completed.
    pub incomplete: bool,
    pub show_logs: bool,
}

/// The aggregated review result.
pub struct Report {
    context: ReportContext,
    systems: Vec<System>,
    reports: BTreeMap<System, SystemReport>,
}

impl Report {
    pub fn new(context: ReportContext, per_system: BTreeMap<System, Vec<ClassifiedAttr>>) -> Self {
        let systems = sort_systems(per_system.keys().cloned());
        let reports = per_system
            .into_iter()
            .map(|(system, attrs)| (system, SystemReport::new(attrs)))
            .collect();
        Report {
            context,
            systems,
            reports,
        }
    }

    /// Systems in conventional order.
    pub fn systems(&self) -> &[System] {
        &self.systems
    }

    pub fn system_report(&self, system: &System) -> Option<&SystemReport> {
        self.reports.get(system)
    }

    pub fn succeeded(&self) -> bool {
        self.reports.values().all(SystemReport::succeeded)
    }

    /// Built attribute names per system, for the shell launcher.
    pub fn built_packages(&self) -> BTreeMap<System, Vec<Attribute>> {
        self.reports
            .iter()
            .map(|(system, report)| {
                (
                    system.clone(),
                    report
                        .of(Outcome::Built)
                        .iter()
                        .map(|e| e.attr.clone())
                        .collect(),
                )
            })
            .collect()
    }

    /// The `report.json` document.
    pub fn to_json(&self) -> serde_json::Value {
        let mut result = serde_json::Map::new();
        for system in &self.systems {
            let report = &self.reports[system];
            let mut lists = serde_json::Map::new();
            for outcome in Outcome::ALL {
                lists.insert(outcome.json_key().to_string(), json!(report.names(outcome)));
            }
            result.insert(system.to_string(), serde_json::Value::Object(lists));
        }
        let mut doc = json!({
            "pr": self.context.pr,
            "commit": self.context.commit,
            "checkout": self.context.checkout,
            "extraNixpkgsConfig": self.context.extra_nixpkgs_config,
            "systems": self.systems.iter().map(System::to_string).collect::<Vec<_>>(),
            "result": result,
        });
        if self.context.incomplete {
            doc["incomplete"] = json!(true);
        }
        doc
    }

    /// The markdown report.
    pub fn markdown(&self) -> String {
        markdown::render(&self.context, &self.systems, &self.reports)
    }

    /// Writes `report.json`, `report.md` and the `results/` symlink tree
    /// into the review directory.
    pub fn write(&self, directory: &Path) -> std::io::Result<()> {
        self.write_result_links(directory)?;
        std::fs::write(
            directory.join("report.md"),
            self.markdown(),
        )?;
        std::fs::write(
            directory.join("report.json"),
            serde_json::to_string_pretty(&self.to_json()).expect("report serializes") + "\n",
        )?;
        Ok(())
    }

    /// `results/<attr>` -> first output path, for every built attribute.
    fn write_result_links(&self, directory: &Path) -> std::io::Result<()> {
        let mut created = false;
        let results = directory.join("results");
        for report in self.reports.values() {
            for entry in report.of(Outcome::Built).iter().chain(report.of(Outcome::Test)) {
                let Some(out_path) = &entry.out_path else {
                    continue;
                };
                if !created {
                    std::fs::create_dir_all(&results)?;
                    created = true;
                }
                let link = results.join(entry.attr.as_str());
                if link.symlink_metadata().is_ok() {
                    std::fs::remove_file(&link)?;
                }
                std::os::unix::fs::symlink(out_path, &link)?;
            }
        }
        Ok(())
    }

    /// Console summary, one line per non-empty category.
    pub fn print_console(&self, directory: &Path) {
        for system in &self.systems {
            let report = &self.reports[system];
            println!("--------- Report for '{system}' ---------");
            let sections = [
                (Outcome::Broken, "marked as broken and skipped"),
                (Outcome::NonExistent, "not found in the checkout"),
                (Outcome::Blacklisted, "blacklisted"),
                (Outcome::Failed, "failed to build"),
                (Outcome::Test, "built (tests)"),
                (Outcome::Built, "built"),
            ];
            for (outcome, label) in sections {
                let names = report.names(outcome);
                if names.is_empty() {
                    continue;
                }
                let plural = if names.len() == 1 { "" } else { "s" };
                println!("{} package{plural} {label}:", names.len());
                println!("{}", names.join(" "));
            }
        }
        println!("Logs can be found under: {}", directory.join("logs").display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, outcome: Outcome) -> ClassifiedAttr {
        ClassifiedAttr {
            attr: Attribute::parse(name).unwrap(),
            outcome,
            aliases: Vec::new(),
            out_path: None,
            log_path: None,
        }
    }

    fn single_system_report(attrs: Vec<ClassifiedAttr>) -> Report {
        Report::new(
            ReportContext {
                checkout: "merge".into(),
                ..ReportContext::default()
            },
            BTreeMap::from([(System::new("x86_64-linux"), attrs)]),
        )
    }

    #[test]
    fn outcome_lists_are_sorted_and_disjoint() {
        let report = single_system_report(vec![
            entry("zlib", Outcome::Built),
            entry("acl", Outcome::Built),
            entry("bash", Outcome::Failed),
        ]);
        let system = System::new("x86_64-linux");
        let sys_report = report.system_report(&system).unwrap();
        assert_eq!(sys_report.names(Outcome::Built), vec!["acl", "zlib"]);
        assert_eq!(sys_report.names(Outcome::Failed), vec!["bash"]);
        assert!(sys_report.names(Outcome::Broken).is_empty());
    }

    #[test]
    fn duplicate_attrs_collapse_to_one_entry() {
        let report = single_system_report(vec![
            entry("acl", Outcome::Built),
            entry("acl", Outcome::Built),
        ]);
        let sys_report = report.system_report(&System::new("x86_64-linux")).unwrap();
        assert_eq!(sys_report.names(Outcome::Built), vec!["acl"]);
    }

    #[test]
    fn succeeded_iff_no_failures() {
        assert!(single_system_report(vec![entry("a", Outcome::Built)]).succeeded());
        assert!(single_system_report(vec![entry("a", Outcome::Broken)]).succeeded());
        assert!(!single_system_report(vec![entry("a", Outcome::Failed)]).succeeded());
    }

    #[test]
    fn json_shape_matches_contract() {
        let report = single_system_report(vec![
            entry("ok", Outcome::Built),
            entry("bad", Outcome::Failed),
            entry("ghost", Outcome::NonExistent),
        ]);
        let doc = report.to_json();
        assert_eq!(doc["checkout"], "merge");
        assert_eq!(doc["systems"], json!(["x86_64-linux"]));
        let result = &doc["result"]["x86_64-linux"];
        assert_eq!(result["built"], json!(["ok"]));
        assert_eq!(result["failed"], json!(["bad"]));
        assert_eq!(result["non-existent"], json!(["ghost"]));
        assert_eq!(result["tests"], json!([]));
        assert!(doc.get("incomplete").is_none());
    }

    #[test]
    fn cancelled_runs_are_marked_incomplete() {
        let report = Report::new(
            ReportContext {
                checkout: "merge".into(),
                incomplete: true,
                ..ReportContext::default()
            },
            BTreeMap::from([(System::new("x86_64-linux"), vec![])]),
        );
        assert_eq!(report.to_json()["incomplete"], json!(true));
    }

    #[test]
    fn json_is_deterministic() {
        let make = || {
            single_system_report(vec![
                entry("b", Outcome::Built),
                entry("a", Outcome::Built),
            ])
            .to_json()
            .to_string()
        };
        assert_eq!(make(), make());
    }

    #[test]
    fn result_links_point_at_out_paths() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("store-out");
        std::fs::create_dir(&out).unwrap();
        let mut built = entry("hello", Outcome::Built);
        built.out_path = Some(out.clone());
        let report = single_system_report(vec![built]);
        report.write(dir.path()).unwrap();

        let link = dir.path().join("results/hello");
        assert_eq!(std::fs::read_link(&link).unwrap(), out);
        assert!(dir.path().join("report.json").exists());
        assert!(dir.path().join("report.md").exists());
    }

    #[test]
    fn systems_are_ordered_conventionally() {
        let report = Report::new(
            ReportContext::default(),
            BTreeMap::from([
                (System::new("aarch64-darwin"), vec![]),
                (System::new("x86_64-linux"), vec![]),
            ]),
        );
        let names: Vec<String> = report.systems().iter().map(System::to_string).collect();
        assert_eq!(names, vec!["x86_64-linux", "aarch64-darwin"]);
    }
}
