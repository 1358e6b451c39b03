//! Port-forward discovery in DNAT rules
//!
//! A rule forwards a port (range) when its expressions contain, in this order:
//!
//! 1. optionally, an equality compare with an IPv4/IPv6 address (the original
//!    destination address),
//! 2. a TCP or UDP match with a non-inverted destination port range,
//! 3. a `DNAT` target carrying a revision 2 NAT range that maps both address
//!    and port.
//!
//! Anything else simply is not a port forward and yields `None`.
//!
//! # Example
//!
//! ```
//! use nftscope::core::expression::*;
//! use nftscope::core::portfinder::forwarded_port_in;
//!
//! let exprs = vec![
//!     Expression::Match(Match {
//!         name: "tcp".to_string(),
//!         info: Some(MatchInfo::Tcp(PortMatch { dst_ports: [42, 666], ..PortMatch::default() })),
//!     }),
//!     Expression::Target(Target {
//!         name: "DNAT".to_string(),
//!         info: Some(TargetInfo::NatRange2(NatRange2 {
//!             range: NatRange {
//!                 flags: NAT_RANGE_MAP_IPS | NAT_RANGE_PROTO_SPECIFIED,
//!                 min_ip: "8.8.8.8".parse().unwrap(),
//!                 max_ip: "8.8.8.8".parse().unwrap(),
//!                 min_port: 777,
//!                 max_port: 777,
//!             },
//!             base_port: 0,
//!         })),
//!     }),
//! ];
//! let forward = forwarded_port_in(&exprs).unwrap();
//! assert_eq!(forward.to_string(), "forwarding tcp from 0.0.0.0:42-666 to 8.8.8.8:777");
//! ```

use crate::core::expression::{
    Cmp, CmpOp, Expression, Match, MatchInfo, NatRange, Target, TargetInfo, NAT_RANGE_MAP_IPS,
    NAT_RANGE_PROTO_SPECIFIED, of_type_where, optional_of_type_where,
};
use crate::core::family::TableFamily;
use crate::core::table::{Rule, TableMap};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;

/// NAT range flags required for a range that maps both addresses and ports
const DNAT_WITH_IPS_AND_PORTS: u32 = NAT_RANGE_MAP_IPS | NAT_RANGE_PROTO_SPECIFIED;

/// A port or port range on an original destination, forwarded to a new
/// destination address and (starting) port
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardedPortRange {
    /// "tcp" or "udp"
    pub protocol: String,
    /// Original destination; the unspecified address when not restricted
    pub ip: IpAddr,
    pub port_min: u16,
    pub port_max: u16,
    pub forward_ip: IpAddr,
    pub forward_port_min: u16,
}

impl fmt::Display for ForwardedPortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "forwarding {} from {}:", self.protocol, host(self.ip))?;
        if self.port_min == self.port_max {
            write!(f, "{}", self.port_min)?;
        } else {
            write!(f, "{}-{}", self.port_min, self.port_max)?;
        }
        write!(f, " to {}:{}", host(self.forward_ip), self.forward_port_min)
    }
}

/// Renders an address so that a ":port" can follow it unambiguously
/// (RFC 3986 brackets for IPv6).
fn host(ip: IpAddr) -> String {
    match ip.to_canonical() {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

/// Destination port range picked from a TCP/UDP match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRangeMatch {
    pub protocol: &'static str,
    pub min: u16,
    pub max: u16,
}

/// Returns the next address compare, if any, together with the expressions
/// after it; otherwise the original expressions and `None`.
pub fn optional_compare_ip(exprs: &[Expression]) -> (&[Expression], Option<IpAddr>) {
    let (rest, cmp) = optional_of_type_where(exprs, is_compare_ip);
    match cmp.and_then(|cmp| ip_from_octets(&cmp.data)) {
        Some(ip) => (rest, Some(ip)),
        None => (exprs, None),
    }
}

fn is_compare_ip(cmp: &Cmp) -> bool {
    cmp.op == CmpOp::Eq && (cmp.data.len() == 4 || cmp.data.len() == 16)
}

fn ip_from_octets(data: &[u8]) -> Option<IpAddr> {
    if let Ok(octets) = <[u8; 4]>::try_from(data) {
        return Some(Ipv4Addr::from(octets).into());
    }
    <[u8; 16]>::try_from(data)
        .ok()
        .map(|octets| Ipv6Addr::from(octets).into())
}

/// Returns the first non-inverted TCP/UDP destination port range and the
/// expressions after it, or `None`.
pub fn match_port_range(exprs: &[Expression]) -> Option<(&[Expression], PortRangeMatch)> {
    let (rest, matched) = of_type_where(exprs, is_tcp_udp_port_range)?;
    let (protocol, ports) = match matched.info.as_ref()? {
        MatchInfo::Tcp(ports) => ("tcp", ports),
        MatchInfo::Udp(ports) => ("udp", ports),
    };
    Some((
        rest,
        PortRangeMatch {
            protocol,
            min: ports.dst_ports[0],
            max: ports.dst_ports[1],
        },
    ))
}

fn is_tcp_udp_port_range(matched: &Match) -> bool {
    match &matched.info {
        Some(MatchInfo::Tcp(ports) | MatchInfo::Udp(ports)) => ports.inv_flags == 0,
        None => false,
    }
}

/// Returns the NAT range of the first `DNAT` target carrying a revision 2
/// range, together with the expressions after it, or `None`. `DNAT` targets
/// with other payloads are skipped.
pub fn target_dnat(exprs: &[Expression]) -> Option<(&[Expression], &NatRange)> {
    let mut remaining = exprs;
    // every round consumes at least the target it looked at
    while !remaining.is_empty() {
        let (rest, target) = of_type_where(remaining, is_target_dnat)?;
        if let Some(TargetInfo::NatRange2(nat)) = &target.info {
            return Some((rest, &nat.range));
        }
        remaining = rest;
    }
    None
}

fn is_target_dnat(target: &Target) -> bool {
    target.name == "DNAT"
}

/// Returns the port forwarding described by `rule`, if any.
pub fn forwarded_port(rule: &Rule) -> Option<ForwardedPortRange> {
    forwarded_port_in(&rule.expressions)
}

/// Returns the port forwarding described by a rule's expressions, if any.
///
/// Addresses are returned in canonical form: IPv4 destinations are never
/// reported as IPv4-mapped IPv6 addresses. Without an original address
/// compare the original address is `0.0.0.0` for IPv4 forwards and `::` for
/// IPv6 forwards.
pub fn forwarded_port_in(exprs: &[Expression]) -> Option<ForwardedPortRange> {
    let (exprs, orig_ip) = optional_compare_ip(exprs);
    let (exprs, ports) = match_port_range(exprs)?;
    let (_, dnat) = target_dnat(exprs)?;
    if dnat.flags & DNAT_WITH_IPS_AND_PORTS != DNAT_WITH_IPS_AND_PORTS
        || ports.min == 0
        || dnat.min_port == 0
    {
        return None;
    }

    let forward_ip = dnat.min_ip.to_canonical();
    let ip = orig_ip.unwrap_or(match forward_ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    });
    Some(ForwardedPortRange {
        protocol: ports.protocol.to_string(),
        ip,
        port_min: ports.min,
        port_max: ports.max,
        forward_ip,
        forward_port_min: dnat.min_port,
    })
}

/// Compares the raw address bytes, 4 for IPv4 and 16 for IPv6.
///
/// Unlike `IpAddr::cmp` this does not group by family: `10.0.0.1` sorts
/// after `::1` because its first byte is larger.
fn compare_octets(a: &IpAddr, b: &IpAddr) -> Ordering {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets().cmp(&b.octets()),
        (IpAddr::V6(a), IpAddr::V6(b)) => a.octets().cmp(&b.octets()),
        (IpAddr::V4(a), IpAddr::V6(b)) => a.octets()[..].cmp(&b.octets()[..]),
        (IpAddr::V6(a), IpAddr::V4(b)) => a.octets()[..].cmp(&b.octets()[..]),
    }
}

/// Total order for reporting: IPv4 before IPv6, then by original address,
/// original start port, and finally the forwarded-to address bytes.
pub fn compare_forwarded_ports(a: &ForwardedPortRange, b: &ForwardedPortRange) -> Ordering {
    // IpAddr orders every V4 before every V6, then byte-wise within a family
    a.ip.cmp(&b.ip)
        .then_with(|| a.port_min.cmp(&b.port_min))
        .then_with(|| compare_octets(&a.forward_ip, &b.forward_ip))
}

/// Collects the port forwards of the named NAT table in each family, sorted
/// with [`compare_forwarded_ports`]. Repeated families are searched once.
pub fn forwarded_ports(
    tables: &TableMap,
    families: &[TableFamily],
    nat_table: &str,
) -> Vec<ForwardedPortRange> {
    let mut forwards = Vec::new();
    let mut searched = BTreeSet::new();
    for &family in families {
        if !searched.insert(family) {
            continue;
        }
        let Some(table) = tables.lookup(nat_table, family) else {
            debug!("No {nat_table:?} table in family {family}");
            continue;
        };
        for chain in table.chains.values() {
            forwards.extend(chain.rules.iter().filter_map(forwarded_port));
        }
    }
    forwards.sort_by(compare_forwarded_ports);
    forwards
}
