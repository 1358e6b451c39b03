//! Flat listings of the netfilter rule base
//!
//! A [`RulesetSource`] answers the four questions the hierarchy builder asks:
//! which tables exist, which chains exist (optionally per family), and which
//! rules a given chain holds. The listings are flat; only the builder in
//! [`crate::core::table`] wires them into a hierarchy.
//!
//! Implementations:
//! - [`crate::core::nft_json::NftSource`] queries the live kernel via `nft --json`
//! - [`crate::core::snapshot::Snapshot`] replays a capture saved to disk

use crate::core::error::Result;
use crate::core::expression::Expression;
use crate::core::family::{ChainHook, TableFamily};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a table: its name, namespaced by its address family
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableKey {
    pub name: String,
    pub family: TableFamily,
}

impl TableKey {
    pub fn new(name: impl Into<String>, family: TableFamily) -> Self {
        Self {
            name: name.into(),
            family,
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.family, self.name)
    }
}

/// Table metadata as listed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub family: TableFamily,
    #[serde(default)]
    pub handle: u64,
    #[serde(default)]
    pub flags: Vec<String>,
}

impl TableInfo {
    /// Minimal metadata for a table only known through one of its chains.
    pub fn from_key(key: &TableKey) -> Self {
        Self {
            name: key.name.clone(),
            family: key.family,
            handle: 0,
            flags: Vec::new(),
        }
    }

    pub fn key(&self) -> TableKey {
        TableKey::new(self.name.clone(), self.family)
    }
}

/// Chain metadata as listed
///
/// Only the owning table's name and family are reliable in a chain listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub name: String,
    pub table: String,
    pub family: TableFamily,
    #[serde(default)]
    pub handle: u64,
    /// Present for base chains only
    #[serde(default)]
    pub hook: Option<ChainHook>,
    #[serde(default, rename = "type")]
    pub chain_type: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub policy: Option<String>,
}

impl ChainInfo {
    pub fn table_key(&self) -> TableKey {
        TableKey::new(self.table.clone(), self.family)
    }
}

/// One rule as listed for its chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleInfo {
    pub handle: u64,
    pub position: u64,
    pub expressions: Vec<Expression>,
}

/// Query interface to the packet-filter subsystem
///
/// All calls are issued sequentially by one caller per snapshot.
#[allow(async_fn_in_trait)]
pub trait RulesetSource {
    /// Lists all tables of all families.
    async fn list_tables(&self) -> Result<Vec<TableInfo>>;

    /// Lists all chains of all families.
    async fn list_chains(&self) -> Result<Vec<ChainInfo>>;

    /// Lists the chains of a single family.
    async fn list_chains_for_family(&self, family: TableFamily) -> Result<Vec<ChainInfo>>;

    /// Lists the rules of one chain, in discovery order.
    async fn get_rules(&self, table: &TableKey, chain: &str) -> Result<Vec<RuleInfo>>;
}
