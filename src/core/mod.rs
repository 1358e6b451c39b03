//! Core rule base introspection
//!
//! This module contains the types and logic for reading the nftables rule base.
//! It provides:
//!
//! - [`error`]: Error types for query and snapshot operations
//! - [`family`]: Address families and hook numbering
//! - [`expression`]: Rule expressions and the typed matching primitives
//! - [`source`]: The [`source::RulesetSource`] query interface and listing records
//! - [`table`]: Reconciliation of flat listings into a table hierarchy
//! - [`portfinder`]: Port-forward discovery in DNAT rules
//! - [`nft_json`]: Live queries through `nft --json`
//! - [`snapshot`]: Offline captures with checksums

pub mod error;
pub mod expression;
pub mod family;
pub mod nft_json;
pub mod portfinder;
pub mod snapshot;
pub mod source;
pub mod table;

#[cfg(test)]
pub mod test_helpers;
