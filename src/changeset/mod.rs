//! Change-set resolution: which attributes does this change rebuild?
//!
//! Two sources feed the candidate set: the CI evaluator's artifact (free)
//! or a local two-pass evaluation that compares derivation paths between
//! the base and merged trees. Either way the result passes through the
//! same filter pipeline: the include set, the skip set, and the committed
//! blacklist.

mod filter;
mod local;

pub use filter::{FilterOutcome, Filters, filter_candidates};
pub use local::{TreeOutputs, diff_trees, list_attr_names, tree_outputs};

use std::collections::BTreeSet;
use std::sync::LazyLock;

use crate::types::Attribute;

/// Attributes never built, committed alongside the code so changes to the
/// list show up in review. See `blacklist.txt`.
static BLACKLIST: LazyLock<BTreeSet<Attribute>> = LazyLock::new(|| {
    include_str!("blacklist.txt")
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| Attribute::parse(line).expect("blacklist entries are valid attributes"))
        .collect()
});

/// The committed blacklist of known-broken or user-hostile attributes.
pub fn builtin_blacklist() -> &'static BTreeSet<Attribute> {
    &BLACKLIST
}
