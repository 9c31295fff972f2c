//! Attribute paths into the package set.
//!
//! An attribute is a dotted name selecting a node in the package-set tree
//! (`pkgs.foo`, `python3Packages.bar.tests.x`). Construction is only
//! possible through [`Attribute::parse`], which enforces the segment
//! grammar, so every `Attribute` in the pipeline is well-formed.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when parsing an invalid attribute path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid attribute path {path:?}: {reason}")]
pub struct InvalidAttribute {
    path: String,
    reason: &'static str,
}

/// A dotted attribute path selecting a node in the package-set tree.
///
/// Each segment must match `[A-Za-z_][A-Za-z0-9_-]*` and no segment may be
/// empty. Comparison and ordering are lexicographic on the full path, which
/// is what keeps report lists deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Attribute(String);

impl Attribute {
    /// Parses a dotted attribute path, validating every segment.
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidAttribute> {
        let s = s.into();
        if s.is_empty() {
            return Err(InvalidAttribute {
                path: s,
                reason: "empty path",
            });
        }
        for segment in s.split('.') {
            if segment.is_empty() {
                return Err(InvalidAttribute {
                    path: s,
                    reason: "empty segment",
                });
            }
            let mut chars = segment.chars();
            let first = chars.next().expect("segment is non-empty");
            if !(first.is_ascii_alphabetic() || first == '_') {
                return Err(InvalidAttribute {
                    path: s,
                    reason: "segment must start with a letter or underscore",
                });
            }
            if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                return Err(InvalidAttribute {
                    path: s,
                    reason: "segment contains an invalid character",
                });
            }
        }
        Ok(Attribute(s))
    }

    /// Returns the attribute path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates over the dotted segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Quotes every segment after the first for splicing into a Nix
    /// expression: `python3Packages.jsonschema` becomes
    /// `python3Packages."jsonschema"`.
    pub fn escaped(&self) -> String {
        let mut segments = self.segments();
        let mut out = segments.next().expect("attribute has a first segment").to_string();
        for segment in segments {
            out.push_str(&format!(".\"{segment}\""));
        }
        out
    }

    /// Whether this attribute is a NixOS test (classified `Test` in reports).
    pub fn is_test(&self) -> bool {
        self.0.starts_with("nixosTests")
    }

    /// The passthru-tests child attribute `<self>.passthru.tests.<name>`.
    pub fn passthru_test(&self, name: &str) -> Result<Attribute, InvalidAttribute> {
        Attribute::parse(format!("{}.passthru.tests.{}", self.0, name))
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Attribute {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Attribute::parse(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_accepts_plain_names() {
        for name in ["hello", "pkgs.hello", "python3Packages.requests", "_internal.a-b"] {
            assert!(Attribute::parse(name).is_ok(), "{name} should parse");
        }
    }

    #[test]
    fn parse_rejects_malformed_paths() {
        for name in ["", ".", "a.", ".a", "a..b", "1abc", "a.1b", "a.b c", "a.b!"] {
            assert!(Attribute::parse(name).is_err(), "{name} should be rejected");
        }
    }

    #[test]
    fn escaped_quotes_trailing_segments() {
        let attr = Attribute::parse("python3Packages.jsonschema.tests.x").unwrap();
        assert_eq!(attr.escaped(), "python3Packages.\"jsonschema\".\"tests\".\"x\"");

        let plain = Attribute::parse("hello").unwrap();
        assert_eq!(plain.escaped(), "hello");
    }

    #[test]
    fn is_test_matches_nixos_tests() {
        assert!(Attribute::parse("nixosTests.login").unwrap().is_test());
        assert!(!Attribute::parse("hello").unwrap().is_test());
    }

    #[test]
    fn passthru_test_builds_child_path() {
        let attr = Attribute::parse("hello").unwrap();
        assert_eq!(
            attr.passthru_test("version").unwrap().as_str(),
            "hello.passthru.tests.version"
        );
    }

    proptest! {
        #[test]
        fn serde_roundtrip(s in "[A-Za-z_][A-Za-z0-9_-]{0,10}(\\.[A-Za-z_][A-Za-z0-9_-]{0,10}){0,3}") {
            let attr = Attribute::parse(&s).unwrap();
            let json = serde_json::to_string(&attr).unwrap();
            let parsed: Attribute = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(attr, parsed);
        }

        #[test]
        fn ordering_matches_underlying(a in "[a-z][a-z0-9]{0,8}", b in "[a-z][a-z0-9]{0,8}") {
            let attr_a = Attribute::parse(&a).unwrap();
            let attr_b = Attribute::parse(&b).unwrap();
            prop_assert_eq!(attr_a.cmp(&attr_b), a.cmp(&b));
        }

        #[test]
        fn deserialize_rejects_invalid(s in "[0-9]+") {
            let json = format!("\"{s}\"");
            let parsed: Result<Attribute, _> = serde_json::from_str(&json);
            prop_assert!(parsed.is_err());
        }
    }
}
