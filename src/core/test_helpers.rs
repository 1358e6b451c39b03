//! Shared test utilities for core module tests
//!
//! Provides an in-memory [`RulesetSource`] and small expression builders so
//! that test suites do not need a live netfilter subsystem.
//! This module is only compiled in test mode.

use crate::core::error::{Error, Result};
use crate::core::expression::{
    Cmp, CmpOp, Counter, Expression, Match, MatchInfo, NatRange, NatRange2, PortMatch, Target,
    TargetInfo, NAT_RANGE_MAP_IPS, NAT_RANGE_PROTO_SPECIFIED,
};
use crate::core::family::{ChainHook, TableFamily};
use crate::core::source::{ChainInfo, RuleInfo, RulesetSource, TableInfo, TableKey};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// In-memory rule base with failure injection
///
/// Records every query in call order, see [`MockSource::calls`].
#[derive(Debug, Default)]
pub struct MockSource {
    tables: Vec<TableInfo>,
    chains: Vec<ChainInfo>,
    rules: HashMap<(TableKey, String), Vec<RuleInfo>>,
    fail_tables: bool,
    fail_chains: bool,
    calls: RefCell<Vec<String>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listed table; handles are assigned in insertion order from 1.
    pub fn with_table(mut self, name: &str, family: TableFamily) -> Self {
        let handle = self.tables.len() as u64 + 1;
        self.tables.push(TableInfo {
            name: name.to_string(),
            family,
            handle,
            flags: Vec::new(),
        });
        self
    }

    pub fn with_chain(mut self, chain: ChainInfo, rules: Vec<RuleInfo>) -> Self {
        self.rules
            .insert((chain.table_key(), chain.name.clone()), rules);
        self.chains.push(chain);
        self
    }

    /// Adds a chain that is listed but whose rules can no longer be fetched.
    pub fn with_vanished_chain(mut self, chain: ChainInfo) -> Self {
        self.chains.push(chain);
        self
    }

    pub fn failing_tables(mut self) -> Self {
        self.fail_tables = true;
        self
    }

    pub fn failing_chains(mut self) -> Self {
        self.fail_chains = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    fn record(&self, call: &str) {
        self.calls.borrow_mut().push(call.to_string());
    }
}

fn listing_failure() -> Error {
    Error::Nftables {
        message: "netlink: Error: Operation not permitted".to_string(),
        stderr: Some("netlink: Error: Operation not permitted".to_string()),
        exit_code: Some(1),
    }
}

impl RulesetSource for MockSource {
    async fn list_tables(&self) -> Result<Vec<TableInfo>> {
        self.record("tables");
        if self.fail_tables {
            return Err(listing_failure());
        }
        Ok(self.tables.clone())
    }

    async fn list_chains(&self) -> Result<Vec<ChainInfo>> {
        self.record("chains");
        if self.fail_chains {
            return Err(listing_failure());
        }
        Ok(self.chains.clone())
    }

    async fn list_chains_for_family(&self, family: TableFamily) -> Result<Vec<ChainInfo>> {
        self.record("family chains");
        if self.fail_chains {
            return Err(listing_failure());
        }
        Ok(self
            .chains
            .iter()
            .filter(|chain| chain.family == family)
            .cloned()
            .collect())
    }

    async fn get_rules(&self, table: &TableKey, chain: &str) -> Result<Vec<RuleInfo>> {
        self.record("rules");
        self.rules
            .get(&(table.clone(), chain.to_string()))
            .cloned()
            .ok_or_else(|| Error::ChainNotFound {
                table: table.name.clone(),
                family: table.family.to_string(),
                chain: chain.to_string(),
            })
    }
}

impl ChainInfo {
    /// Turns a test chain into a base chain at `hook`.
    pub fn hooked(mut self, hook: ChainHook) -> Self {
        self.hook = Some(hook);
        self.chain_type = Some("nat".to_string());
        self.priority = Some(-100);
        self.policy = Some("accept".to_string());
        self
    }
}

pub fn chain_info(table: &str, family: TableFamily, name: &str) -> ChainInfo {
    ChainInfo {
        name: name.to_string(),
        table: table.to_string(),
        family,
        handle: 0,
        hook: None,
        chain_type: None,
        priority: None,
        policy: None,
    }
}

pub fn rule_info(handle: u64, position: u64, expressions: Vec<Expression>) -> RuleInfo {
    RuleInfo {
        handle,
        position,
        expressions,
    }
}

/// Parses an address literal, panicking on typos in tests.
pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub fn other(kind: &str) -> Expression {
    Expression::Other {
        kind: kind.to_string(),
    }
}

pub fn counter() -> Expression {
    Expression::Counter(Counter::default())
}

/// Equality compare against an address, 4 or 16 bytes of data.
pub fn cmp_ip(addr: &str) -> Expression {
    let data = match ip(addr) {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    Expression::Cmp(Cmp {
        op: CmpOp::Eq,
        data,
    })
}

/// TCP or UDP match on a destination port range.
pub fn port_match(protocol: &str, min: u16, max: u16, inv_flags: u8) -> Expression {
    let ports = PortMatch {
        dst_ports: [min, max],
        inv_flags,
        ..PortMatch::default()
    };
    let info = if protocol == "udp" {
        MatchInfo::Udp(ports)
    } else {
        MatchInfo::Tcp(ports)
    };
    Expression::Match(Match {
        name: protocol.to_string(),
        info: Some(info),
    })
}

fn nat_range(min_ip: &str, min_port: u16, flags: u32) -> NatRange {
    NatRange {
        flags,
        min_ip: ip(min_ip),
        max_ip: ip(min_ip),
        min_port,
        max_port: min_port,
    }
}

/// DNAT target with a revision 2 NAT range.
pub fn dnat(min_ip: &str, min_port: u16, flags: u32) -> Expression {
    Expression::Target(Target {
        name: "DNAT".to_string(),
        info: Some(TargetInfo::NatRange2(NatRange2 {
            range: nat_range(min_ip, min_port, flags),
            base_port: 0,
        })),
    })
}

/// DNAT target with a revision 1 NAT range.
pub fn dnat_v1(min_ip: &str, min_port: u16) -> Expression {
    Expression::Target(Target {
        name: "DNAT".to_string(),
        info: Some(TargetInfo::NatRange(nat_range(
            min_ip,
            min_port,
            NAT_RANGE_MAP_IPS | NAT_RANGE_PROTO_SPECIFIED,
        ))),
    })
}
