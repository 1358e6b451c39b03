//! Netfilter address families and chain hook names
//!
//! Every table lives in exactly one address family; the same table name in two
//! families denotes two unrelated tables. Hook numbers only acquire a name in
//! the context of a family (hook 0 is `INGRESS` on netdev, `PREROUTING`
//! elsewhere).

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Netfilter table (address) family
///
/// Discriminants are the netfilter `NFPROTO_*` values, names are the keywords
/// `nft` uses on its command line and in its JSON output.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[repr(u8)]
pub enum TableFamily {
    #[strum(serialize = "unspec")]
    #[serde(rename = "unspec")]
    Unspecified = 0,
    /// IPv4 and IPv6 combined
    #[strum(serialize = "inet")]
    #[serde(rename = "inet")]
    Inet = 1,
    #[strum(serialize = "ip")]
    #[serde(rename = "ip")]
    Ipv4 = 2,
    #[strum(serialize = "arp")]
    #[serde(rename = "arp")]
    Arp = 3,
    #[strum(serialize = "netdev")]
    #[serde(rename = "netdev")]
    Netdev = 5,
    #[strum(serialize = "bridge")]
    #[serde(rename = "bridge")]
    Bridge = 7,
    #[strum(serialize = "ip6")]
    #[serde(rename = "ip6")]
    Ipv6 = 10,
}

/// Chain hook number, the point in the packet path a base chain attaches to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ChainHook(pub u32);

impl ChainHook {
    pub const PREROUTING: ChainHook = ChainHook(0);
    pub const INPUT: ChainHook = ChainHook(1);
    pub const FORWARD: ChainHook = ChainHook(2);
    pub const OUTPUT: ChainHook = ChainHook(3);
    pub const POSTROUTING: ChainHook = ChainHook(4);
    /// netdev ingress shares its number with prerouting
    pub const INGRESS: ChainHook = ChainHook(0);
    /// netdev egress shares its number with input
    pub const EGRESS: ChainHook = ChainHook(1);

    /// Returns the hook name as used in the given table family.
    pub fn name(self, family: TableFamily) -> Cow<'static, str> {
        match (self, family) {
            (ChainHook(0), TableFamily::Netdev) => Cow::Borrowed("INGRESS"),
            (ChainHook(1), TableFamily::Netdev) => Cow::Borrowed("EGRESS"),
            (ChainHook(0), _) => Cow::Borrowed("PREROUTING"),
            (ChainHook(1), _) => Cow::Borrowed("INPUT"),
            (ChainHook(2), _) => Cow::Borrowed("FORWARD"),
            (ChainHook(3), _) => Cow::Borrowed("OUTPUT"),
            (ChainHook(4), _) => Cow::Borrowed("POSTROUTING"),
            (ChainHook(n), _) => Cow::Owned(format!("ChainHook({n})")),
        }
    }

    /// Maps an `nft` hook keyword ("prerouting", "ingress", ...) to its number.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "prerouting" => Some(Self::PREROUTING),
            "ingress" => Some(Self::INGRESS),
            "input" => Some(Self::INPUT),
            "egress" => Some(Self::EGRESS),
            "forward" => Some(Self::FORWARD),
            "output" => Some(Self::OUTPUT),
            "postrouting" => Some(Self::POSTROUTING),
            _ => None,
        }
    }
}

impl fmt::Display for ChainHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name(TableFamily::Inet))
    }
}
