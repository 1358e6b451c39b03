//! Rule expressions and type-directed matching over expression sequences
//!
//! A rule is an ordered list of primitive [`Expression`]s that execute left to
//! right. Only the handful of kinds needed to reason about NAT rules carry
//! decoded fields; everything else is kept as [`Expression::Other`] so that
//! sequence positions stay intact.
//!
//! # Matching
//!
//! [`of_type`] and [`of_type_where`] return the first expression of a given
//! kind (and satisfying a predicate) together with the expressions strictly
//! after it, or `None` when nothing qualifies. [`optional_of_type`] and
//! [`optional_of_type_where`] never fail: on a miss they hand back the
//! untouched input so a pipeline can carry on from where it started.
//!
//! ```
//! use nftscope::core::expression::{optional_of_type_where, Cmp, CmpOp, Counter, Expression};
//!
//! let exprs = vec![
//!     Expression::Counter(Counter::default()),
//!     Expression::Cmp(Cmp { op: CmpOp::Eq, data: vec![10, 0, 0, 1] }),
//!     Expression::Counter(Counter::default()),
//! ];
//! let (rest, cmp) = optional_of_type_where(&exprs, |cmp: &Cmp| cmp.data.len() == 4);
//! assert!(cmp.is_some());
//! assert_eq!(rest.len(), 1);
//! ```

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// `NF_NAT_RANGE_MAP_IPS`: the NAT range carries addresses
pub const NAT_RANGE_MAP_IPS: u32 = 1 << 0;
/// `NF_NAT_RANGE_PROTO_SPECIFIED`: the NAT range carries transport ports
pub const NAT_RANGE_PROTO_SPECIFIED: u32 = 1 << 1;

/// `XT_TCP_INV_DSTPT` / `XT_UDP_INV_DSTPT`
pub const PORT_MATCH_INV_DST_PORTS: u8 = 0x02;
/// `XT_TCP_INV_SRCPT` / `XT_UDP_INV_SRCPT`
pub const PORT_MATCH_INV_SRC_PORTS: u8 = 0x01;

/// One primitive operation of a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expression {
    /// Loads a protocol header field into a register
    Payload(Payload),
    /// Compares register contents with constant data
    Cmp(Cmp),
    Counter(Counter),
    /// Protocol-specific (xtables) match extension
    Match(Match),
    /// Action (xtables) target extension, such as DNAT
    Target(Target),
    /// Accept, drop, jump and friends
    Verdict(Verdict),
    /// Any kind this crate does not decode
    Other { kind: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub protocol: String,
    pub field: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CmpOp {
    /// Maps an `nft` relational operator to a compare operation.
    pub fn from_nft(op: &str) -> Option<Self> {
        match op {
            "==" | "in" => Some(Self::Eq),
            "!=" => Some(Self::Neq),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Lte),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Gte),
            _ => None,
        }
    }
}

/// Register compare; `data` is in network byte order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cmp {
    pub op: CmpOp,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub name: String,
    /// Extension payload, absent when it could not be decoded
    pub info: Option<MatchInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchInfo {
    Tcp(PortMatch),
    Udp(PortMatch),
}

/// Port ranges of an `xt_tcp`/`xt_udp` match, both bounds inclusive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMatch {
    pub src_ports: [u16; 2],
    pub dst_ports: [u16; 2],
    pub inv_flags: u8,
}

impl Default for PortMatch {
    fn default() -> Self {
        Self {
            src_ports: [0, u16::MAX],
            dst_ports: [0, u16::MAX],
            inv_flags: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    /// Extension payload, absent when it could not be decoded
    pub info: Option<TargetInfo>,
}

/// NAT target payloads; the revision decides the layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetInfo {
    /// Revision 1 `nf_nat_range`
    NatRange(NatRange),
    /// Revision 2 `nf_nat_range2`
    NatRange2(NatRange2),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRange {
    pub flags: u32,
    pub min_ip: IpAddr,
    pub max_ip: IpAddr,
    pub min_port: u16,
    pub max_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRange2 {
    pub range: NatRange,
    pub base_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub kind: String,
    pub chain: Option<String>,
}

/// An expression kind that can be picked out of an [`Expression`]
pub trait ExpressionKind: Sized + 'static {
    fn from_expression(expr: &Expression) -> Option<&Self>;
}

macro_rules! expression_kind {
    ($variant:ident, $ty:ty) => {
        impl ExpressionKind for $ty {
            fn from_expression(expr: &Expression) -> Option<&Self> {
                match expr {
                    Expression::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

expression_kind!(Payload, Payload);
expression_kind!(Cmp, Cmp);
expression_kind!(Counter, Counter);
expression_kind!(Match, Match);
expression_kind!(Target, Target);
expression_kind!(Verdict, Verdict);

/// Returns the first expression of kind `E` together with the expressions
/// following it, or `None` if there is no such expression.
pub fn of_type<E: ExpressionKind>(exprs: &[Expression]) -> Option<(&[Expression], &E)> {
    of_type_where(exprs, |_: &E| true)
}

/// Returns the first expression of kind `E` for which `predicate` holds,
/// together with the expressions following it, or `None`.
pub fn of_type_where<E, F>(exprs: &[Expression], predicate: F) -> Option<(&[Expression], &E)>
where
    E: ExpressionKind,
    F: Fn(&E) -> bool,
{
    exprs.iter().enumerate().find_map(|(idx, expr)| {
        E::from_expression(expr)
            .filter(|&e| predicate(e))
            .map(|e| (&exprs[idx + 1..], e))
    })
}

/// Like [`of_type`], but a miss returns the original expressions and `None`.
pub fn optional_of_type<E: ExpressionKind>(exprs: &[Expression]) -> (&[Expression], Option<&E>) {
    optional_of_type_where(exprs, |_: &E| true)
}

/// Like [`of_type_where`], but a miss returns the original expressions and
/// `None`.
pub fn optional_of_type_where<E, F>(exprs: &[Expression], predicate: F) -> (&[Expression], Option<&E>)
where
    E: ExpressionKind,
    F: Fn(&E) -> bool,
{
    match of_type_where(exprs, predicate) {
        Some((rest, e)) => (rest, Some(e)),
        None => (exprs, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn other(kind: &str) -> Expression {
        Expression::Other {
            kind: kind.to_string(),
        }
    }

    fn cmp(op: CmpOp) -> Expression {
        Expression::Cmp(Cmp { op, data: vec![] })
    }

    #[test]
    fn test_of_type_returns_match_and_rest() {
        let exprs = vec![other("bitwise"), cmp(CmpOp::Gt), Expression::Counter(Counter::default())];

        let (rest, found) = of_type::<Cmp>(&exprs).expect("cmp present");
        assert_eq!(found.op, CmpOp::Gt);
        assert_eq!(rest.len(), 1);

        let (rest, found) = optional_of_type::<Cmp>(&exprs);
        assert_eq!(found.map(|c| c.op), Some(CmpOp::Gt));
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn test_of_type_miss_is_none() {
        let exprs = vec![other("bitwise"), Expression::Counter(Counter::default())];
        assert!(of_type::<Cmp>(&exprs).is_none());
    }

    #[test]
    fn test_optional_miss_returns_original() {
        let exprs = vec![other("bitwise"), Expression::Counter(Counter::default())];
        let (rest, found) = optional_of_type::<Cmp>(&exprs);
        assert!(found.is_none());
        assert_eq!(rest, exprs.as_slice());
    }

    #[test]
    fn test_of_type_where_honors_predicate() {
        let exprs = vec![other("bitwise"), cmp(CmpOp::Eq), cmp(CmpOp::Gt), other("range")];

        let (rest, found) = of_type_where(&exprs, |c: &Cmp| c.op == CmpOp::Gt).expect("gt present");
        assert_eq!(found.op, CmpOp::Gt);
        assert_eq!(rest, &exprs[3..]);

        assert!(of_type_where(&exprs, |c: &Cmp| c.op == CmpOp::Lt).is_none());
    }

    #[test]
    fn test_optional_of_type_where_miss_returns_original() {
        let exprs = vec![other("bitwise"), cmp(CmpOp::Gte), Expression::Counter(Counter::default())];
        let (rest, found) = optional_of_type_where(&exprs, |_: &Cmp| false);
        assert!(found.is_none());
        assert_eq!(rest.len(), exprs.len());
        assert!(std::ptr::eq(rest, exprs.as_slice()));
    }

    #[test]
    fn test_match_at_end_leaves_empty_rest() {
        let exprs = vec![other("meta"), Expression::Counter(Counter { packets: 1, bytes: 2 })];
        let (rest, counter) = of_type::<Counter>(&exprs).expect("counter present");
        assert!(rest.is_empty());
        assert_eq!(counter.bytes, 2);
    }

    #[test]
    fn test_cmp_op_from_nft() {
        assert_eq!(CmpOp::from_nft("=="), Some(CmpOp::Eq));
        assert_eq!(CmpOp::from_nft("!="), Some(CmpOp::Neq));
        assert_eq!(CmpOp::from_nft(">="), Some(CmpOp::Gte));
        assert_eq!(CmpOp::from_nft("&"), None);
    }

    #[test]
    fn test_expression_serde_tagging() {
        let expr = Expression::Target(Target {
            name: "DNAT".to_string(),
            info: Some(TargetInfo::NatRange2(NatRange2 {
                range: NatRange {
                    flags: NAT_RANGE_MAP_IPS,
                    min_ip: "10.0.0.1".parse().unwrap(),
                    max_ip: "10.0.0.1".parse().unwrap(),
                    min_port: 0,
                    max_port: 0,
                },
                base_port: 0,
            })),
        });
        let json = serde_json::to_value(&expr).unwrap();
        assert_eq!(json["type"], "target");
        assert_eq!(json["info"]["kind"], "nat_range2");
        assert_eq!(json["info"]["range"]["min_ip"], "10.0.0.1");

        let back: Expression = serde_json::from_value(json).unwrap();
        assert_eq!(back, expr);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_expression() -> impl Strategy<Value = Expression> {
        prop_oneof![
            (0u64..4).prop_map(|packets| Expression::Counter(Counter { packets, bytes: 0 })),
            prop_oneof![Just(CmpOp::Eq), Just(CmpOp::Gt), Just(CmpOp::Lt)]
                .prop_map(|op| Expression::Cmp(Cmp { op, data: vec![1] })),
            "[a-z]{1,6}".prop_map(|kind| Expression::Other { kind }),
        ]
    }

    fn qualifies(expr: &Expression) -> bool {
        matches!(expr, Expression::Cmp(Cmp { op: CmpOp::Gt, .. }))
    }

    proptest! {
        #[test]
        fn test_mandatory_match_returns_exact_suffix(
            exprs in proptest::collection::vec(arb_expression(), 0..12)
        ) {
            match of_type_where(&exprs, |c: &Cmp| c.op == CmpOp::Gt) {
                Some((rest, found)) => {
                    let idx = exprs.len() - rest.len() - 1;
                    prop_assert_eq!(&exprs[idx], &Expression::Cmp(found.clone()));
                    prop_assert_eq!(rest, &exprs[idx + 1..]);
                    prop_assert!(!exprs[..idx].iter().any(qualifies));
                }
                None => prop_assert!(!exprs.iter().any(qualifies)),
            }
        }

        #[test]
        fn test_optional_miss_is_identity(
            exprs in proptest::collection::vec(arb_expression(), 0..12)
        ) {
            let (rest, found) = optional_of_type_where(&exprs, |c: &Cmp| c.op == CmpOp::Gt);
            if found.is_none() {
                prop_assert!(std::ptr::eq(rest, exprs.as_slice()));
            } else {
                prop_assert!(rest.len() < exprs.len());
            }
        }
    }
}
