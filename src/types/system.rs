//! Target systems and the closed alias set.
//!
//! A system names a platform triple (`x86_64-linux`, `aarch64-darwin`).
//! User input additionally accepts aliases (`current`, `all`, `linux`,
//! `darwin`, `x64`, `aarch64`) which expand to concrete platform sets.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The platforms the upstream CI evaluator knows about.
pub const PLATFORMS_LINUX: [&str; 2] = ["aarch64-linux", "x86_64-linux"];
pub const PLATFORMS_DARWIN: [&str; 2] = ["aarch64-darwin", "x86_64-darwin"];
pub const PLATFORMS_AARCH64: [&str; 2] = ["aarch64-darwin", "aarch64-linux"];
pub const PLATFORMS_X64: [&str; 2] = ["x86_64-darwin", "x86_64-linux"];

/// A target system triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct System(pub String);

impl System {
    pub fn new(s: impl Into<String>) -> Self {
        System(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sort key that keeps report sections in the conventional order:
/// x86_64-linux, aarch64-linux, x86_64-darwin, aarch64-darwin.
///
/// Reversing the dash-separated segments gives `linuxx86_64` etc., which
/// sorts into the desired order when compared descending.
pub fn system_order_key(system: &System) -> String {
    system.0.split('-').rev().collect::<Vec<_>>().join("")
}

/// Sorts systems into the conventional report order.
pub fn sort_systems(systems: impl IntoIterator<Item = System>) -> Vec<System> {
    let mut out: Vec<System> = systems.into_iter().collect();
    out.sort_by_key(|s| std::cmp::Reverse(system_order_key(s)));
    out
}

/// Expands one user-supplied system string, resolving the closed alias set.
///
/// Unknown strings pass through verbatim as a concrete system name.
pub fn expand_system_aliases(input: &str, current: &System) -> BTreeSet<System> {
    let to_set = |names: &[&str]| names.iter().map(|s| System::new(*s)).collect();
    match input.to_lowercase().as_str() {
        "current" => [current.clone()].into_iter().collect(),
        "all" => PLATFORMS_LINUX
            .iter()
            .chain(PLATFORMS_DARWIN.iter())
            .map(|s| System::new(*s))
            .collect(),
        "linux" => to_set(&PLATFORMS_LINUX),
        "darwin" | "macos" => to_set(&PLATFORMS_DARWIN),
        "x64" | "x86" | "x86_64" | "x86-64" | "x64_86" | "x64-86" => to_set(&PLATFORMS_X64),
        "aarch64" | "arm64" => to_set(&PLATFORMS_AARCH64),
        other => [System::new(other)].into_iter().collect(),
    }
}

/// The system this process runs on, derived from the build target.
pub fn current_system_name() -> System {
    let arch = match std::env::consts::ARCH {
        "aarch64" => "aarch64",
        _ => "x86_64",
    };
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        _ => "linux",
    };
    System::new(format!("{arch}-{os}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current() -> System {
        System::new("x86_64-linux")
    }

    #[test]
    fn current_alias_expands_to_local_system() {
        let set = expand_system_aliases("current", &current());
        assert_eq!(set, [current()].into_iter().collect());
    }

    #[test]
    fn all_alias_expands_to_four_platforms() {
        let set = expand_system_aliases("all", &current());
        assert_eq!(set.len(), 4);
        assert!(set.contains(&System::new("aarch64-darwin")));
    }

    #[test]
    fn arch_aliases_are_case_insensitive() {
        let set = expand_system_aliases("AArch64", &current());
        assert_eq!(
            set,
            [System::new("aarch64-darwin"), System::new("aarch64-linux")]
                .into_iter()
                .collect()
        );
    }

    #[test]
    fn concrete_system_passes_through() {
        let set = expand_system_aliases("riscv64-linux", &current());
        assert_eq!(set, [System::new("riscv64-linux")].into_iter().collect());
    }

    #[test]
    fn sort_order_is_conventional() {
        let sorted = sort_systems([
            System::new("aarch64-darwin"),
            System::new("x86_64-linux"),
            System::new("x86_64-darwin"),
            System::new("aarch64-linux"),
        ]);
        let names: Vec<&str> = sorted.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            names,
            ["x86_64-linux", "aarch64-linux", "x86_64-darwin", "aarch64-darwin"]
        );
    }
}
