//! nftscope - read-only nftables introspection
//!
//! Reads the netfilter rule base, reconciles the flat listings of tables,
//! chains and rules into a table hierarchy, and finds port forwardings in
//! DNAT rules.
//!
//! # Architecture
//!
//! - [`core`] - Rule base model, matching primitives, hierarchy builder and port finder
//! - [`elevation`] - Privilege escalation for the `nft` queries
//! - [`config`] - Persisted user defaults
//! - [`report`] - Textual rendering of dumps
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Example
//!
//! ```no_run
//! use nftscope::{build_hierarchy, forwarded_ports, NftSource, TableFamily};
//!
//! # async fn example() -> nftscope::Result<()> {
//! let families = [TableFamily::Ipv4, TableFamily::Ipv6];
//! let tables = build_hierarchy(&NftSource::new(), &families).await?;
//! for forward in forwarded_ports(&tables, &families, "nat") {
//!     println!("{forward}");
//! }
//! # Ok(())
//! # }
//! ```

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod core;
pub mod elevation;
pub mod report;
pub mod utils;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::family::{ChainHook, TableFamily};
pub use core::nft_json::NftSource;
pub use core::portfinder::{forwarded_ports, ForwardedPortRange};
pub use core::snapshot::Snapshot;
pub use core::source::RulesetSource;
pub use core::table::{build_family_hierarchy, build_full_hierarchy, build_hierarchy, TableMap};
