//! Candidate filtering: include set, skip set, committed blacklist.
//!
//! Filters apply in order. A non-empty include set restricts candidates
//! to its members plus `package_regex` matches (search semantics); then
//! `skip_package` members and `skip_package_regex` full matches are
//! removed; finally the committed blacklist drops known-broken entries.
//! Attributes a filter removed from the original candidate set are
//! reported as `Blacklisted`.

use std::collections::BTreeSet;

use regex::Regex;

use crate::types::Attribute;

use super::builtin_blacklist;

/// The user-configurable filter portion of the pipeline.
#[derive(Debug, Default)]
pub struct Filters {
    pub package: BTreeSet<Attribute>,
    /// Search semantics: a match anywhere in the attribute path counts.
    pub package_regex: Vec<Regex>,
    pub skip_package: BTreeSet<Attribute>,
    /// Full-match semantics: the whole attribute path must match.
    pub skip_package_regex: Vec<Regex>,
}

impl Filters {
    fn is_selective(&self) -> bool {
        !self.package.is_empty() || !self.package_regex.is_empty()
    }
}

/// Result of filtering one system's candidate set.
#[derive(Debug, PartialEq, Eq)]
pub struct FilterOutcome {
    /// What the dispatcher will evaluate and the scheduler build.
    pub selected: BTreeSet<Attribute>,
    /// Candidates removed by skip filters or the blacklist.
    pub excluded: BTreeSet<Attribute>,
}

/// Applies the filter pipeline to one candidate set.
///
/// Explicitly requested packages (`--package`) always enter the selected
/// set, even when they were not rebuild candidates: the dispatcher
/// classifies requests for attributes that do not exist.
pub fn filter_candidates(candidates: &BTreeSet<Attribute>, filters: &Filters) -> FilterOutcome {
    let mut selected: BTreeSet<Attribute> = if filters.is_selective() {
        let mut out = filters.package.clone();
        for attr in candidates {
            if filters
                .package_regex
                .iter()
                .any(|re| re.is_match(attr.as_str()))
            {
                out.insert(attr.clone());
            }
        }
        out
    } else {
        candidates.clone()
    };

    let mut excluded = BTreeSet::new();
    let full_match = |re: &Regex, s: &str| {
        re.find(s)
            .is_some_and(|m| m.start() == 0 && m.end() == s.len())
    };

    selected.retain(|attr| {
        let skipped = filters.skip_package.contains(attr)
            || filters
                .skip_package_regex
                .iter()
                .any(|re| full_match(re, attr.as_str()))
            || builtin_blacklist().contains(attr);
        if skipped && candidates.contains(attr) {
            excluded.insert(attr.clone());
        }
        !skipped
    });

    FilterOutcome { selected, excluded }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(s: &str) -> Attribute {
        Attribute::parse(s).unwrap()
    }

    fn attrs(names: &[&str]) -> BTreeSet<Attribute> {
        names.iter().map(|s| attr(s)).collect()
    }

    #[test]
    fn no_filters_pass_everything_through() {
        let candidates = attrs(&["a", "b"]);
        let outcome = filter_candidates(&candidates, &Filters::default());
        assert_eq!(outcome.selected, candidates);
        assert!(outcome.excluded.is_empty());
    }

    #[test]
    fn include_set_restricts_candidates() {
        let candidates = attrs(&["a", "b", "c"]);
        let filters = Filters {
            package: attrs(&["b"]),
            ..Filters::default()
        };
        let outcome = filter_candidates(&candidates, &filters);
        assert_eq!(outcome.selected, attrs(&["b"]));
    }

    #[test]
    fn requested_package_outside_candidates_is_kept() {
        // `--package ghost` where ghost was never a rebuild candidate:
        // the dispatcher classifies it as non-existent.
        let candidates = attrs(&["pkg1"]);
        let filters = Filters {
            package: attrs(&["ghost", "pkg1"]),
            ..Filters::default()
        };
        let outcome = filter_candidates(&candidates, &filters);
        assert_eq!(outcome.selected, attrs(&["ghost", "pkg1"]));
    }

    #[test]
    fn package_regex_uses_search_semantics() {
        let candidates = attrs(&["python3Packages.requests", "hello"]);
        let filters = Filters {
            package_regex: vec![Regex::new("requests").unwrap()],
            ..Filters::default()
        };
        let outcome = filter_candidates(&candidates, &filters);
        assert_eq!(outcome.selected, attrs(&["python3Packages.requests"]));
    }

    #[test]
    fn skip_package_removes_and_records() {
        let candidates = attrs(&["a", "b"]);
        let filters = Filters {
            skip_package: attrs(&["b"]),
            ..Filters::default()
        };
        let outcome = filter_candidates(&candidates, &filters);
        assert_eq!(outcome.selected, attrs(&["a"]));
        assert_eq!(outcome.excluded, attrs(&["b"]));
    }

    #[test]
    fn skip_regex_uses_full_match_semantics() {
        let candidates = attrs(&["linux", "linux-firmware"]);
        let filters = Filters {
            skip_package_regex: vec![Regex::new("linux").unwrap()],
            ..Filters::default()
        };
        let outcome = filter_candidates(&candidates, &filters);
        // Only the exact "linux" is a full match; "linux-firmware" stays.
        assert_eq!(outcome.selected, attrs(&["linux-firmware"]));
        assert_eq!(outcome.excluded, attrs(&["linux"]));
    }

    #[test]
    fn blacklisted_candidates_are_recorded() {
        let candidates = attrs(&["appimage-run-tests", "hello"]);
        let outcome = filter_candidates(&candidates, &Filters::default());
        assert_eq!(outcome.selected, attrs(&["hello"]));
        assert_eq!(outcome.excluded, attrs(&["appimage-run-tests"]));
    }

    #[test]
    fn blacklisted_non_candidate_is_not_recorded() {
        // Explicitly requesting a blacklisted attr that was never a
        // candidate drops it silently from the build, but it is not
        // reported as blacklisted (it was not in the candidate set).
        let candidates = attrs(&["hello"]);
        let filters = Filters {
            package: attrs(&["appimage-run-tests", "hello"]),
            ..Filters::default()
        };
        let outcome = filter_candidates(&candidates, &filters);
        assert_eq!(outcome.selected, attrs(&["hello"]));
        assert!(outcome.excluded.is_empty());
    }
}
