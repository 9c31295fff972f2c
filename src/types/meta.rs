//! Evaluation results and terminal outcomes for (attribute, system) pairs.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Attribute;

/// Violation of the evaluation-result schema. Always fatal: a malformed
/// per-system map means the review would be incomplete.
#[derive(Debug, Clone, Error)]
#[error("invalid evaluation result for {attr}: {reason}")]
pub struct InvalidMeta {
    pub attr: String,
    pub reason: String,
}

/// Resolved evaluation result for one (attribute, system) pair.
///
/// Invariants, checked by [`DerivationMeta::validate`]:
/// - `broken` implies `drv_path` is absent
/// - not `broken` implies `drv_path` is present
/// - `exists == false` implies `broken`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivationMeta {
    pub exists: bool,
    pub broken: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drv_path: Option<String>,
    /// Output name to store path. Empty when broken.
    #[serde(default)]
    pub out_paths: BTreeMap<String, PathBuf>,
}

impl DerivationMeta {
    /// Checks the schema invariants, naming the offending attribute.
    pub fn validate(&self, attr: &Attribute) -> Result<(), InvalidMeta> {
        let fail = |reason: &str| {
            Err(InvalidMeta {
                attr: attr.to_string(),
                reason: reason.to_string(),
            })
        };
        if self.broken && self.drv_path.is_some() {
            return fail("broken attribute must not carry a drvPath");
        }
        if !self.broken && self.drv_path.is_none() {
            return fail("non-broken attribute must carry a drvPath");
        }
        if !self.exists && !self.broken {
            return fail("nonexistent attribute must be marked broken");
        }
        Ok(())
    }

    /// The first output path in output-name order, used for `results/` links.
    pub fn first_out_path(&self) -> Option<&PathBuf> {
        // "out" is the conventional primary output; prefer it when present.
        self.out_paths.get("out").or_else(|| self.out_paths.values().next())
    }
}

/// Terminal classification of one (attribute, system) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Built,
    Failed,
    Broken,
    Blacklisted,
    NonExistent,
    Test,
}

impl Outcome {
    /// All outcomes, in report-section order.
    pub const ALL: [Outcome; 6] = [
        Outcome::Broken,
        Outcome::NonExistent,
        Outcome::Blacklisted,
        Outcome::Failed,
        Outcome::Test,
        Outcome::Built,
    ];

    /// The key used for this outcome in `report.json`.
    pub fn json_key(&self) -> &'static str {
        match self {
            Outcome::Built => "built",
            Outcome::Failed => "failed",
            Outcome::Broken => "broken",
            Outcome::Blacklisted => "blacklisted",
            Outcome::NonExistent => "non-existent",
            Outcome::Test => "tests",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr() -> Attribute {
        Attribute::parse("hello").unwrap()
    }

    fn meta(exists: bool, broken: bool, drv: Option<&str>) -> DerivationMeta {
        DerivationMeta {
            exists,
            broken,
            drv_path: drv.map(str::to_string),
            out_paths: BTreeMap::new(),
        }
    }

    #[test]
    fn valid_built_meta_passes() {
        assert!(meta(true, false, Some("/nix/store/x.drv")).validate(&attr()).is_ok());
    }

    #[test]
    fn valid_broken_meta_passes() {
        assert!(meta(true, true, None).validate(&attr()).is_ok());
        assert!(meta(false, true, None).validate(&attr()).is_ok());
    }

    #[test]
    fn broken_with_drv_path_rejected() {
        assert!(meta(true, true, Some("/nix/store/x.drv")).validate(&attr()).is_err());
    }

    #[test]
    fn non_broken_without_drv_path_rejected() {
        assert!(meta(true, false, None).validate(&attr()).is_err());
    }

    #[test]
    fn nonexistent_must_be_broken() {
        assert!(meta(false, false, Some("/nix/store/x.drv")).validate(&attr()).is_err());
    }

    #[test]
    fn first_out_path_prefers_out() {
        let mut m = meta(true, false, Some("/nix/store/x.drv"));
        m.out_paths.insert("doc".into(), PathBuf::from("/nix/store/doc"));
        m.out_paths.insert("out".into(), PathBuf::from("/nix/store/out"));
        assert_eq!(m.first_out_path(), Some(&PathBuf::from("/nix/store/out")));
    }

    #[test]
    fn meta_deserializes_from_eval_json() {
        let json = r#"{"exists": true, "broken": false, "drvPath": "/nix/store/a.drv",
                       "outPaths": {"out": "/nix/store/a"}}"#;
        let m: DerivationMeta = serde_json::from_str(json).unwrap();
        assert!(m.exists);
        assert_eq!(m.drv_path.as_deref(), Some("/nix/store/a.drv"));
        assert!(m.validate(&attr()).is_ok());
    }

    #[test]
    fn outcome_json_keys_are_stable() {
        assert_eq!(Outcome::NonExistent.json_key(), "non-existent");
        assert_eq!(Outcome::Test.json_key(), "tests");
    }
}
