//! Domain types shared across the review pipeline.
//!
//! Newtypes prevent accidental mixing of identifiers (an attribute path is
//! not a commit SHA) and centralise the validation rules the rest of the
//! pipeline relies on.

pub mod attr;
pub mod ids;
pub mod meta;
pub mod system;

pub use attr::{Attribute, InvalidAttribute};
pub use ids::{InvalidSha, PrNumber, Sha};
pub use meta::{DerivationMeta, InvalidMeta, Outcome};
pub use system::{
    System, current_system_name, expand_system_aliases, sort_systems, system_order_key,
};
