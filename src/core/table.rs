//! Table → chain → rule hierarchy of the netfilter rule base
//!
//! The query interface only hands out flat listings: tables, chains (which
//! reference their table by name and family only) and, per chain, its rules.
//! The builders in this module reconcile these listings into a [`TableMap`].
//!
//! # Ownership
//!
//! Tables own their chains and chains own their rules. The upward links are
//! keys, not references: a [`Chain`] stores the [`TableKey`] of its table and
//! a [`Rule`] stores the [`ChainKey`] of its chain. Use [`TableMap::table_of`]
//! and [`TableMap::chain_of`] to navigate upwards.
//!
//! # Live data
//!
//! The rule base may change between listing chains and fetching a chain's
//! rules. A chain whose rules cannot be fetched is dropped from the result
//! (and logged); only failures to list tables or chains at all are errors.

use crate::core::error::{Error, Result};
use crate::core::expression::Expression;
use crate::core::family::TableFamily;
use crate::core::source::{ChainInfo, RuleInfo, RulesetSource, TableInfo, TableKey};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Identity of a chain: its table plus its name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ChainKey {
    pub table: TableKey,
    pub name: String,
}

/// A rule with its ordered expressions
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rule {
    pub handle: u64,
    pub position: u64,
    pub expressions: Vec<Expression>,
    /// The chain this rule belongs to
    pub chain: ChainKey,
}

/// A chain with its rules, sorted by position
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chain {
    pub info: ChainInfo,
    /// The table this chain belongs to
    pub table: TableKey,
    pub rules: Vec<Rule>,
}

impl Chain {
    pub fn name(&self) -> &str {
        &self.info.name
    }
}

/// A table with its chains, indexed by chain name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Table {
    pub info: TableInfo,
    pub chains: BTreeMap<String, Chain>,
}

impl Table {
    fn new(info: TableInfo) -> Self {
        Self {
            info,
            chains: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn family(&self) -> TableFamily {
        self.info.family
    }

    pub fn chain(&self, name: &str) -> Option<&Chain> {
        self.chains.get(name)
    }
}

/// All tables of one snapshot, indexed by name and family
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableMap {
    tables: BTreeMap<TableKey, Table>,
}

impl Serialize for TableMap {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_seq(self.tables.values())
    }
}

impl TableMap {
    /// Returns the named table of the given family.
    pub fn lookup(&self, name: &str, family: TableFamily) -> Option<&Table> {
        self.tables.get(&TableKey::new(name, family))
    }

    /// Returns the named chain of the named table in the given family.
    pub fn lookup_chain(&self, table: &str, family: TableFamily, chain: &str) -> Option<&Chain> {
        self.lookup(table, family)?.chain(chain)
    }

    /// Returns the table owning `chain`.
    pub fn table_of(&self, chain: &Chain) -> Option<&Table> {
        self.tables.get(&chain.table)
    }

    /// Returns the chain owning `rule`.
    pub fn chain_of(&self, rule: &Rule) -> Option<&Chain> {
        self.tables.get(&rule.chain.table)?.chain(&rule.chain.name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TableKey> {
        self.tables.keys()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Moves all tables of `other` into this map; tables of the same key are
    /// replaced.
    pub fn merge(&mut self, other: TableMap) {
        self.tables.extend(other.tables);
    }

    fn insert_table(&mut self, info: TableInfo) {
        self.tables.insert(info.key(), Table::new(info));
    }

    /// Fetches the chain's rules and files the chain under its table,
    /// fabricating the table entry from the chain's table name and family if
    /// no table listing provided one. Chains whose rules cannot be fetched are
    /// dropped.
    async fn add_chain<S: RulesetSource>(&mut self, source: &S, chain: ChainInfo) {
        let key = chain.table_key();
        let listed = match source.get_rules(&key, &chain.name).await {
            Ok(rules) => rules,
            Err(e) => {
                warn!("Dropping chain {:?} of table {}: {}", chain.name, key, e);
                return;
            }
        };

        let chain_key = ChainKey {
            table: key.clone(),
            name: chain.name.clone(),
        };
        let mut rules: Vec<Rule> = listed
            .into_iter()
            .map(|RuleInfo { handle, position, expressions }| Rule {
                handle,
                position,
                expressions,
                chain: chain_key.clone(),
            })
            .collect();
        rules.sort_by_key(|rule| rule.position);
        debug!("Chain {:?} of table {} has {} rule(s)", chain.name, key, rules.len());

        let table = self
            .tables
            .entry(key.clone())
            .or_insert_with(|| Table::new(TableInfo::from_key(&key)));
        table.chains.insert(
            chain.name.clone(),
            Chain {
                info: chain,
                table: key,
                rules,
            },
        );
    }
}

/// Builds the complete hierarchy: lists all tables first, then attaches all
/// chains of all families together with their rules.
///
/// # Errors
///
/// Returns [`Error::Query`] if tables or chains cannot be listed.
pub async fn build_full_hierarchy<S: RulesetSource>(source: &S) -> Result<TableMap> {
    let tables = source
        .list_tables()
        .await
        .map_err(|e| Error::query("tables", e))?;
    let mut table_map = TableMap::default();
    for table in tables {
        table_map.insert_table(table);
    }

    let chains = source
        .list_chains()
        .await
        .map_err(|e| Error::query("chains", e))?;
    for chain in chains {
        table_map.add_chain(source, chain).await;
    }

    info!("Discovered {} table(s) across all families", table_map.len());
    Ok(table_map)
}

/// Builds the hierarchy of a single family from its chains only; tables carry
/// just the name and family known from their chains.
///
/// # Errors
///
/// Returns [`Error::Query`] if the family's chains cannot be listed.
pub async fn build_family_hierarchy<S: RulesetSource>(
    source: &S,
    family: TableFamily,
) -> Result<TableMap> {
    let chains = source
        .list_chains_for_family(family)
        .await
        .map_err(|e| Error::query(format!("{family} chains"), e))?;
    let mut table_map = TableMap::default();
    for chain in chains {
        table_map.add_chain(source, chain).await;
    }

    info!("Discovered {} table(s) in family {}", table_map.len(), family);
    Ok(table_map)
}

/// Builds the hierarchy for the given families, using full discovery when no
/// family or [`TableFamily::Unspecified`] is requested. Repeated families are
/// queried once.
///
/// # Errors
///
/// Returns [`Error::Query`] on the first listing failure.
pub async fn build_hierarchy<S: RulesetSource>(
    source: &S,
    families: &[TableFamily],
) -> Result<TableMap> {
    if families.is_empty() || families.contains(&TableFamily::Unspecified) {
        return build_full_hierarchy(source).await;
    }
    let mut table_map = TableMap::default();
    let mut queried = BTreeSet::new();
    for &family in families {
        if !queried.insert(family) {
            continue;
        }
        table_map.merge(build_family_hierarchy(source, family).await?);
    }
    Ok(table_map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::family::ChainHook;
    use crate::core::test_helpers::{chain_info, counter, rule_info, MockSource};

    fn sample_source() -> MockSource {
        MockSource::new()
            .with_table("nat", TableFamily::Ipv4)
            .with_table("filter", TableFamily::Ipv4)
            .with_chain(
                chain_info("nat", TableFamily::Ipv4, "PREROUTING").hooked(ChainHook::PREROUTING),
                vec![rule_info(7, 2, vec![counter()]), rule_info(5, 0, vec![]), rule_info(6, 1, vec![])],
            )
            .with_chain(chain_info("nat", TableFamily::Ipv4, "POSTROUTING"), vec![])
            .with_chain(chain_info("filter", TableFamily::Ipv4, "INPUT"), vec![])
            .with_chain(chain_info("nat", TableFamily::Ipv6, "PREROUTING"), vec![])
    }

    #[tokio::test]
    async fn test_full_discovery_attaches_chains() {
        let source = sample_source();
        let tables = build_full_hierarchy(&source).await.unwrap();

        assert!(tables.lookup("nat", TableFamily::Ipv4).is_some());
        assert!(tables.lookup("filter", TableFamily::Ipv4).is_some());
        assert!(tables.lookup_chain("nat", TableFamily::Ipv4, "POSTROUTING").is_some());
        assert!(tables.lookup_chain("nat", TableFamily::Ipv4, "XXX").is_none());
        assert!(tables.lookup_chain("xxx", TableFamily::Ipv4, "XXX").is_none());
        assert_eq!(source.calls(), vec!["tables", "chains", "rules", "rules", "rules", "rules"]);
    }

    #[tokio::test]
    async fn test_full_discovery_keeps_listed_table_metadata() {
        let source = sample_source();
        let tables = build_full_hierarchy(&source).await.unwrap();
        let nat = tables.lookup("nat", TableFamily::Ipv4).unwrap();
        assert_eq!(nat.info.handle, 1);
    }

    #[tokio::test]
    async fn test_same_name_different_family_are_distinct() {
        let source = sample_source();
        let tables = build_full_hierarchy(&source).await.unwrap();

        // ip6 nat was never listed as a table, so it is fabricated from its chain
        let nat6 = tables.lookup("nat", TableFamily::Ipv6).unwrap();
        assert_eq!(nat6.info.handle, 0);
        assert_eq!(nat6.chains.len(), 1);
        assert_eq!(tables.lookup("nat", TableFamily::Ipv4).unwrap().chains.len(), 2);
    }

    #[tokio::test]
    async fn test_rules_sorted_by_position() {
        let source = sample_source();
        let tables = build_full_hierarchy(&source).await.unwrap();
        let chain = tables.lookup_chain("nat", TableFamily::Ipv4, "PREROUTING").unwrap();

        let positions: Vec<u64> = chain.rules.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        let handles: Vec<u64> = chain.rules.iter().map(|r| r.handle).collect();
        assert_eq!(handles, vec![5, 6, 7]);
    }

    #[tokio::test]
    async fn test_back_references_resolve() {
        let source = sample_source();
        let tables = build_full_hierarchy(&source).await.unwrap();
        let chain = tables.lookup_chain("nat", TableFamily::Ipv4, "PREROUTING").unwrap();
        let rule = &chain.rules[0];

        assert_eq!(tables.chain_of(rule), Some(chain));
        let table = tables.table_of(chain).unwrap();
        assert_eq!(table.name(), "nat");
        assert_eq!(table.family(), TableFamily::Ipv4);
    }

    #[tokio::test]
    async fn test_family_discovery_only_uses_chains() {
        let source = sample_source();
        let tables = build_family_hierarchy(&source, TableFamily::Ipv4).await.unwrap();

        assert!(tables.keys().all(|key| key.family == TableFamily::Ipv4));
        assert!(tables.lookup("nat", TableFamily::Ipv6).is_none());
        // metadata is minimal since tables were never listed
        assert_eq!(tables.lookup("nat", TableFamily::Ipv4).unwrap().info.handle, 0);
        assert!(!source.calls().contains(&"tables".to_string()));
    }

    #[tokio::test]
    async fn test_vanished_chain_is_dropped() {
        let source = sample_source().with_vanished_chain(chain_info("nat", TableFamily::Ipv4, "DOCKER"));
        let tables = build_full_hierarchy(&source).await.unwrap();

        assert!(tables.lookup_chain("nat", TableFamily::Ipv4, "DOCKER").is_none());
        assert!(tables.lookup_chain("nat", TableFamily::Ipv4, "PREROUTING").is_some());
    }

    #[tokio::test]
    async fn test_vanished_chain_does_not_fabricate_table() {
        let source = MockSource::new().with_vanished_chain(chain_info("gone", TableFamily::Inet, "x"));
        let tables = build_family_hierarchy(&source, TableFamily::Inet).await.unwrap();
        assert!(tables.is_empty());
    }

    #[tokio::test]
    async fn test_table_listing_failure_is_fatal() {
        let source = sample_source().failing_tables();
        let err = build_full_hierarchy(&source).await.unwrap_err();
        assert!(matches!(err, Error::Query { ref what, .. } if what == "tables"));
    }

    #[tokio::test]
    async fn test_chain_listing_failure_is_fatal() {
        let source = sample_source().failing_chains();
        let err = build_full_hierarchy(&source).await.unwrap_err();
        assert!(matches!(err, Error::Query { ref what, .. } if what == "chains"));

        let err = build_family_hierarchy(&source, TableFamily::Ipv6).await.unwrap_err();
        assert!(err.to_string().contains("ip6 chains"));
    }

    #[tokio::test]
    async fn test_build_hierarchy_merges_families() {
        let source = sample_source();
        let tables = build_hierarchy(&source, &[TableFamily::Ipv4, TableFamily::Ipv6])
            .await
            .unwrap();
        assert_eq!(tables.len(), 3);

        let all = build_hierarchy(&source, &[TableFamily::Unspecified]).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(source.calls().contains(&"tables".to_string()));
    }

    #[tokio::test]
    async fn test_build_hierarchy_queries_repeated_family_once() {
        let source = sample_source();
        let tables = build_hierarchy(&source, &[TableFamily::Ipv4, TableFamily::Ipv4])
            .await
            .unwrap();
        assert_eq!(tables.len(), 2);

        let family_listings = source
            .calls()
            .iter()
            .filter(|call| call.as_str() == "family chains")
            .count();
        assert_eq!(family_listings, 1);
    }
}
