//! Newtype wrappers for commit and pull-request identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when parsing an invalid SHA.
#[derive(Debug, Clone, Error)]
#[error("invalid SHA: expected 40 hex characters, got {len} bytes: {preview}")]
pub struct InvalidSha {
    len: usize,
    preview: String,
}

/// A pull request number on the upstream repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrNumber(pub u64);

impl fmt::Display for PrNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for PrNumber {
    fn from(n: u64) -> Self {
        PrNumber(n)
    }
}

/// A git commit SHA (40 hex characters).
///
/// Construction is only possible via `Sha::parse`, which validates and
/// normalises the input to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Sha(String);

impl Sha {
    /// Parses a string as a SHA, validating that it is exactly 40 hex characters.
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidSha> {
        let s = s.into();
        if s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Sha(s.to_ascii_lowercase()))
        } else {
            Err(InvalidSha {
                len: s.len(),
                preview: s.chars().take(20).collect(),
            })
        }
    }

    /// Returns the SHA as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short (7-character) version for display.
    pub fn short(&self) -> &str {
        &self.0[..7]
    }
}

impl fmt::Display for Sha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Sha {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Sha::parse(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn serde_roundtrip(s in "[0-9a-f]{40}") {
            let sha = Sha::parse(&s).unwrap();
            let json = serde_json::to_string(&sha).unwrap();
            let parsed: Sha = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(sha, parsed);
        }

        #[test]
        fn short_returns_7_chars(s in "[0-9a-f]{40}") {
            let sha = Sha::parse(&s).unwrap();
            prop_assert_eq!(sha.short(), &s[..7]);
        }

        #[test]
        fn parse_rejects_invalid_length(s in "[0-9a-f]{0,39}|[0-9a-f]{41,80}") {
            prop_assert!(Sha::parse(&s).is_err());
        }

        #[test]
        fn parse_normalizes_to_lowercase(s in "[0-9A-Fa-f]{40}") {
            let sha = Sha::parse(&s).unwrap();
            prop_assert_eq!(sha.as_str(), s.to_ascii_lowercase());
        }

        #[test]
        fn pr_number_display(n: u64) {
            prop_assert_eq!(format!("{}", PrNumber(n)), format!("#{}", n));
        }
    }

    #[test]
    fn deserialize_rejects_invalid_sha() {
        let json = r#""not-a-valid-sha""#;
        let result: Result<Sha, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }
}
