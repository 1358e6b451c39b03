//! Textual rendering of rule base dumps and port forwards

use crate::core::portfinder::ForwardedPortRange;
use crate::core::table::{Chain, TableMap};
use crate::utils::indent_lines;
use std::fmt::Write;

fn render_chain(out: &mut String, chain: &Chain) {
    let _ = write!(
        out,
        "  CHAIN {:?} TYPE {:?}",
        chain.name(),
        chain.info.chain_type.as_deref().unwrap_or("")
    );
    if let Some(hook) = chain.info.hook {
        let _ = write!(out, " HOOK {:?}", hook.name(chain.table.family));
    }
    out.push('\n');

    for rule in &chain.rules {
        let _ = writeln!(out, "    RULE HANDLE {} POS {}", rule.handle, rule.position);
        for expr in &rule.expressions {
            let _ = writeln!(out, "{}", indent_lines(&format!("EXPR {expr:#?}"), 3));
        }
    }
}

/// Renders tables, chains, rules and expressions, one item per line.
///
/// `table_names` restricts the dump to tables of these names; empty means all.
pub fn render_dump(tables: &TableMap, table_names: &[String]) -> String {
    let mut out = String::new();
    for table in tables.tables() {
        if !table_names.is_empty() && !table_names.iter().any(|name| name == table.name()) {
            continue;
        }
        let _ = writeln!(out, "TABLE {:?} FAMILY {}", table.name(), table.family());
        for chain in table.chains.values() {
            render_chain(&mut out, chain);
        }
    }
    out
}

/// Renders one port forward per line, in the given order.
pub fn render_ports(forwards: &[ForwardedPortRange]) -> String {
    forwards.iter().map(|forward| format!("{forward}\n")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::expression::{NAT_RANGE_MAP_IPS, NAT_RANGE_PROTO_SPECIFIED};
    use crate::core::family::{ChainHook, TableFamily};
    use crate::core::portfinder::forwarded_ports;
    use crate::core::table::build_full_hierarchy;
    use crate::core::test_helpers::{chain_info, counter, dnat, port_match, rule_info, MockSource};

    fn source() -> MockSource {
        MockSource::new()
            .with_table("nat", TableFamily::Ipv4)
            .with_table("filter", TableFamily::Inet)
            .with_chain(
                chain_info("nat", TableFamily::Ipv4, "PREROUTING").hooked(ChainHook::PREROUTING),
                vec![rule_info(
                    9,
                    0,
                    vec![
                        port_match("udp", 53, 53, 0),
                        dnat("10.1.1.1", 5353, NAT_RANGE_MAP_IPS | NAT_RANGE_PROTO_SPECIFIED),
                    ],
                )],
            )
            .with_chain(chain_info("filter", TableFamily::Inet, "scratch"), vec![rule_info(1, 0, vec![counter()])])
    }

    #[tokio::test]
    async fn test_dump_layout() {
        let tables = build_full_hierarchy(&source()).await.unwrap();
        let dump = render_dump(&tables, &[]);
        let lines: Vec<&str> = dump.lines().collect();

        assert!(lines.contains(&"TABLE \"nat\" FAMILY ip"));
        assert!(lines.contains(&"  CHAIN \"PREROUTING\" TYPE \"nat\" HOOK \"PREROUTING\""));
        assert!(lines.contains(&"  CHAIN \"scratch\" TYPE \"\""));
        assert!(lines.contains(&"    RULE HANDLE 9 POS 0"));
        assert!(lines.iter().any(|line| line.starts_with("      EXPR Match(")));
        assert!(lines.iter().any(|line| line.starts_with("      EXPR Counter(")));
    }

    #[tokio::test]
    async fn test_dump_table_filter() {
        let tables = build_full_hierarchy(&source()).await.unwrap();
        let dump = render_dump(&tables, &["filter".to_string()]);

        assert!(dump.contains("TABLE \"filter\" FAMILY inet"));
        assert!(!dump.contains("TABLE \"nat\""));
        assert!(render_dump(&tables, &["missing".to_string()]).is_empty());
    }

    #[tokio::test]
    async fn test_render_ports() {
        let tables = build_full_hierarchy(&source()).await.unwrap();
        let forwards = forwarded_ports(&tables, &[TableFamily::Ipv4, TableFamily::Ipv6], "nat");

        assert_eq!(
            render_ports(&forwards),
            "forwarding udp from 0.0.0.0:53 to 10.1.1.1:5353\n"
        );
        assert_eq!(render_ports(&[]), "");
    }
}
