//! Live rule base queries through `nft --json`
//!
//! [`NftSource`] runs the (elevated) `nft` binary and lowers its JSON output
//! into the listing records of [`crate::core::source`]. Statements of a rule
//! are lowered into [`Expression`]s as follows:
//!
//! | nft statement                         | expressions                    |
//! |---------------------------------------|--------------------------------|
//! | `match` on `tcp`/`udp` `dport`/`sport` | `Match` with port ranges       |
//! | `match` on any other payload          | `Payload` + `Cmp` (or `Other`) |
//! | `dnat`                                | `Target` "DNAT", `NatRange2`   |
//! | `xt` match/target                     | `Match`/`Target` without info  |
//! | `counter`                             | `Counter`                      |
//! | `accept`, `drop`, `jump`, ...         | `Verdict`                      |
//!
//! Everything else becomes [`Expression::Other`] carrying the statement name.

use crate::core::error::{Error, Result};
use crate::core::expression::{
    Cmp, CmpOp, Counter, Expression, Match, MatchInfo, NatRange, NatRange2, Payload, PortMatch,
    Target, TargetInfo, Verdict, NAT_RANGE_MAP_IPS, NAT_RANGE_PROTO_SPECIFIED,
    PORT_MATCH_INV_DST_PORTS, PORT_MATCH_INV_SRC_PORTS,
};
use crate::core::family::{ChainHook, TableFamily};
use crate::core::source::{ChainInfo, RuleInfo, RulesetSource, TableInfo, TableKey};
use serde::Deserialize;
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, error, warn};

/// Queries the running kernel by invoking `nft --json list ...`
#[derive(Debug, Clone, Copy, Default)]
pub struct NftSource;

impl NftSource {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, args: &[&str]) -> Result<Value> {
        debug!("Running nft {}", args.join(" "));

        let output = crate::elevation::create_elevated_nft_command(args)?
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                error!("Failed to spawn nft: {e}");
                Error::Internal(format!("Failed to spawn nft: {e}"))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!("nft {} failed: {stderr}", args.join(" "));
            return Err(Error::Nftables {
                message: stderr.lines().next().unwrap_or("nft exited with an error").to_string(),
                stderr: Some(stderr),
                exit_code: output.status.code(),
            });
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

impl RulesetSource for NftSource {
    async fn list_tables(&self) -> Result<Vec<TableInfo>> {
        parse_tables(&self.run(&["--json", "list", "tables"]).await?)
    }

    async fn list_chains(&self) -> Result<Vec<ChainInfo>> {
        parse_chains(&self.run(&["--json", "list", "chains"]).await?)
    }

    async fn list_chains_for_family(&self, family: TableFamily) -> Result<Vec<ChainInfo>> {
        if family == TableFamily::Unspecified {
            return self.list_chains().await;
        }
        parse_chains(&self.run(&["--json", "list", "chains", family.as_ref()]).await?)
    }

    async fn get_rules(&self, table: &TableKey, chain: &str) -> Result<Vec<RuleInfo>> {
        let doc = self
            .run(&["--json", "list", "chain", table.family.as_ref(), &table.name, chain])
            .await?;
        parse_rules(&doc, table.family)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFlags {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct RawTable {
    family: String,
    name: String,
    #[serde(default)]
    handle: u64,
    #[serde(default)]
    flags: Option<RawFlags>,
}

#[derive(Debug, Deserialize)]
struct RawChain {
    family: String,
    table: String,
    name: String,
    #[serde(default)]
    handle: u64,
    #[serde(default, rename = "type")]
    chain_type: Option<String>,
    #[serde(default)]
    hook: Option<String>,
    #[serde(default)]
    prio: Option<Value>,
    #[serde(default)]
    policy: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    #[serde(default)]
    handle: u64,
    #[serde(default)]
    expr: Vec<Value>,
}

/// Yields the bodies of all objects of one kind in an `nft --json` document.
fn objects<'a>(doc: &'a Value, kind: &'a str) -> Result<impl Iterator<Item = &'a Value>> {
    let entries = doc
        .get("nftables")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Internal("Invalid nft output: missing nftables array".to_string()))?;
    Ok(entries.iter().filter_map(move |entry| entry.get(kind)))
}

fn parse_family(family: &str, what: &str) -> Option<TableFamily> {
    match family.parse() {
        Ok(family) => Some(family),
        Err(_) => {
            warn!("Skipping {what} of unknown family {family:?}");
            None
        }
    }
}

/// Extracts the table listing from `nft --json list tables` output.
pub fn parse_tables(doc: &Value) -> Result<Vec<TableInfo>> {
    let mut tables = Vec::new();
    for body in objects(doc, "table")? {
        let raw = RawTable::deserialize(body)?;
        let Some(family) = parse_family(&raw.family, "table") else {
            continue;
        };
        let flags = match raw.flags {
            None => Vec::new(),
            Some(RawFlags::One(flag)) => vec![flag],
            Some(RawFlags::Many(flags)) => flags,
        };
        tables.push(TableInfo {
            name: raw.name,
            family,
            handle: raw.handle,
            flags,
        });
    }
    Ok(tables)
}

/// Extracts the chain listing from `nft --json list chains` output.
pub fn parse_chains(doc: &Value) -> Result<Vec<ChainInfo>> {
    let mut chains = Vec::new();
    for body in objects(doc, "chain")? {
        let raw = RawChain::deserialize(body)?;
        let Some(family) = parse_family(&raw.family, "chain") else {
            continue;
        };
        let hook = raw.hook.as_deref().and_then(|keyword| {
            let hook = ChainHook::from_keyword(keyword);
            if hook.is_none() {
                warn!("Unknown hook {keyword:?} on chain {:?}", raw.name);
            }
            hook
        });
        let priority = raw
            .prio
            .as_ref()
            .and_then(Value::as_i64)
            .and_then(|prio| i32::try_from(prio).ok());
        chains.push(ChainInfo {
            name: raw.name,
            table: raw.table,
            family,
            handle: raw.handle,
            hook,
            chain_type: raw.chain_type,
            priority,
            policy: raw.policy,
        });
    }
    Ok(chains)
}

/// Extracts the rules from `nft --json list chain` output.
///
/// Positions are assigned in listing order.
pub fn parse_rules(doc: &Value, family: TableFamily) -> Result<Vec<RuleInfo>> {
    let mut rules = Vec::new();
    for (position, body) in objects(doc, "rule")?.enumerate() {
        let raw = RawRule::deserialize(body)?;
        let mut expressions = Vec::with_capacity(raw.expr.len());
        for statement in &raw.expr {
            lower_statement(statement, family, &mut expressions);
        }
        rules.push(RuleInfo {
            handle: raw.handle,
            position: position as u64,
            expressions,
        });
    }
    Ok(rules)
}

fn other(kind: &str) -> Expression {
    Expression::Other {
        kind: kind.to_string(),
    }
}

/// Lowers one nft JSON statement into one or more expressions.
pub fn lower_statement(statement: &Value, family: TableFamily, out: &mut Vec<Expression>) {
    let Some((kind, body)) = statement.as_object().and_then(|obj| obj.iter().next()) else {
        out.push(other("unknown"));
        return;
    };

    match kind.as_str() {
        "match" => lower_match(body, out),
        "counter" => out.push(Expression::Counter(Counter {
            packets: body.get("packets").and_then(Value::as_u64).unwrap_or(0),
            bytes: body.get("bytes").and_then(Value::as_u64).unwrap_or(0),
        })),
        "dnat" => out.push(lower_dnat(body, family).unwrap_or_else(|| other("dnat"))),
        "xt" => out.push(lower_xt(body)),
        "accept" | "drop" | "return" | "continue" => out.push(Expression::Verdict(Verdict {
            kind: kind.clone(),
            chain: None,
        })),
        "jump" | "goto" => out.push(Expression::Verdict(Verdict {
            kind: kind.clone(),
            chain: body.get("target").and_then(Value::as_str).map(str::to_string),
        })),
        _ => out.push(other(kind)),
    }
}

fn lower_match(body: &Value, out: &mut Vec<Expression>) {
    let op = body.get("op").and_then(Value::as_str).and_then(CmpOp::from_nft);
    let payload = body.get("left").and_then(|left| left.get("payload"));
    let (Some(op), Some(payload)) = (op, payload) else {
        out.push(other("match"));
        return;
    };
    let protocol = payload.get("protocol").and_then(Value::as_str).unwrap_or_default();
    let field = payload.get("field").and_then(Value::as_str).unwrap_or_default();
    let right = body.get("right").unwrap_or(&Value::Null);

    if let Some(port_match) = lower_port_match(protocol, field, op, right) {
        out.push(port_match);
        return;
    }

    out.push(Expression::Payload(Payload {
        protocol: protocol.to_string(),
        field: field.to_string(),
    }));
    out.push(match address_octets(right) {
        Some(data) => Expression::Cmp(Cmp { op, data }),
        None => other("cmp"),
    });
}

fn lower_port_match(protocol: &str, field: &str, op: CmpOp, right: &Value) -> Option<Expression> {
    let inv_flag = match field {
        "dport" => PORT_MATCH_INV_DST_PORTS,
        "sport" => PORT_MATCH_INV_SRC_PORTS,
        _ => return None,
    };
    let inv_flags = match op {
        CmpOp::Eq => 0,
        CmpOp::Neq => inv_flag,
        _ => return None,
    };
    let (min, max) = value_range(right, port)?;

    let mut ports = PortMatch {
        inv_flags,
        ..PortMatch::default()
    };
    if field == "dport" {
        ports.dst_ports = [min, max];
    } else {
        ports.src_ports = [min, max];
    }
    let info = match protocol {
        "tcp" => MatchInfo::Tcp(ports),
        "udp" => MatchInfo::Udp(ports),
        _ => return None,
    };
    Some(Expression::Match(Match {
        name: protocol.to_string(),
        info: Some(info),
    }))
}

fn lower_dnat(body: &Value, family: TableFamily) -> Option<Expression> {
    let mut flags = 0;
    let (min_ip, max_ip) = if let Some(addr) = body.get("addr") {
        flags |= NAT_RANGE_MAP_IPS;
        value_range(addr, address)?
    } else {
        let dnat_family = body.get("family").and_then(Value::as_str);
        let any = if dnat_family == Some("ip6") || family == TableFamily::Ipv6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        (any, any)
    };
    let (min_port, max_port) = if let Some(ports) = body.get("port") {
        flags |= NAT_RANGE_PROTO_SPECIFIED;
        value_range(ports, port)?
    } else {
        (0, 0)
    };

    Some(Expression::Target(Target {
        name: "DNAT".to_string(),
        info: Some(TargetInfo::NatRange2(NatRange2 {
            range: NatRange {
                flags,
                min_ip,
                max_ip,
                min_port,
                max_port,
            },
            base_port: 0,
        })),
    }))
}

fn lower_xt(body: &Value) -> Expression {
    let name = body.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
    match body.get("type").and_then(Value::as_str) {
        Some("match") => Expression::Match(Match { name, info: None }),
        Some("target") => Expression::Target(Target { name, info: None }),
        _ => other("xt"),
    }
}

/// Reads either a single value or a `{"range": [lo, hi]}` object.
fn value_range<T: Copy>(value: &Value, parse: impl Fn(&Value) -> Option<T>) -> Option<(T, T)> {
    if let Some([lo, hi]) = value.get("range").and_then(Value::as_array).map(Vec::as_slice) {
        return Some((parse(lo)?, parse(hi)?));
    }
    let single = parse(value)?;
    Some((single, single))
}

fn port(value: &Value) -> Option<u16> {
    value.as_u64().and_then(|n| u16::try_from(n).ok())
}

fn address(value: &Value) -> Option<IpAddr> {
    value.as_str()?.parse().ok()
}

fn address_octets(value: &Value) -> Option<Vec<u8>> {
    Some(match address(value)? {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    })
}
