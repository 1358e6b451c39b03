//! nftscope - read-only nftables introspection
//!
//! Dumps the netfilter rule base down to the level of expressions and lists
//! the port forwardings configured through DNAT rules.
//!
//! # Usage
//!
//! ```bash
//! nftscope dump                          # Dump IPv4 and IPv6 tables
//! nftscope dump -f all -t nat            # Dump every "nat" table of all families
//! nftscope ports                         # List forwarded ports of the "nat" tables
//! nftscope ports --json                  # Same, as JSON
//! nftscope snapshot -o capture.json      # Capture the rule base to a file
//! nftscope ports --from capture.json     # Inspect a capture without privileges
//! nftscope config -f all --json true     # Change the persisted defaults
//! ```

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use nftscope::config::{self, AppConfig};
use nftscope::core::error::NftablesErrorPattern;
use nftscope::core::portfinder::forwarded_ports;
use nftscope::report::{render_dump, render_ports};
use nftscope::{build_hierarchy, Error, NftSource, Result, RulesetSource, Snapshot, TableFamily};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use strum::IntoEnumIterator;
use tracing::Level;

#[derive(Parser)]
#[command(name = "nftscope")]
#[command(version, about = "Read-only nftables introspection", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Table family as given on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FamilyArg {
    All,
    Arp,
    Bridge,
    Inet,
    #[value(aliases = ["ipv4", "ip"])]
    V4,
    #[value(aliases = ["ipv6", "ip6"])]
    V6,
    Netdev,
}

impl From<FamilyArg> for TableFamily {
    fn from(arg: FamilyArg) -> Self {
        match arg {
            FamilyArg::All => TableFamily::Unspecified,
            FamilyArg::Arp => TableFamily::Arp,
            FamilyArg::Bridge => TableFamily::Bridge,
            FamilyArg::Inet => TableFamily::Inet,
            FamilyArg::V4 => TableFamily::Ipv4,
            FamilyArg::V6 => TableFamily::Ipv6,
            FamilyArg::Netdev => TableFamily::Netdev,
        }
    }
}

#[derive(Args)]
struct QueryArgs {
    /// Table families to query, 'all' or any combination (default: v4,v6)
    #[arg(short, long, value_enum, value_delimiter = ',')]
    family: Vec<FamilyArg>,

    /// Read a saved snapshot instead of querying the kernel
    #[arg(long, value_name = "SNAPSHOT")]
    from: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump tables with their chains, rules and expressions
    Dump {
        #[command(flatten)]
        query: QueryArgs,
        /// Restrict the dump to these table names
        #[arg(short, long, value_delimiter = ',')]
        table: Vec<String>,
    },
    /// List forwarded ports found in the NAT tables
    Ports {
        #[command(flatten)]
        query: QueryArgs,
        /// Name of the NAT table (default: nat)
        #[arg(long, value_name = "NAME")]
        nat_table: Option<String>,
    },
    /// Capture the live rule base to a snapshot file
    Snapshot {
        /// Output path (default: timestamped file in the state directory)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Show or change the persisted defaults
    Config {
        /// Families queried when --family is not given
        #[arg(short, long, value_enum, value_delimiter = ',')]
        family: Vec<FamilyArg>,
        /// NAT table searched when --nat-table is not given
        #[arg(long, value_name = "NAME")]
        nat_table: Option<String>,
        /// Print JSON unless --json is given
        #[arg(long, value_name = "BOOL")]
        json: Option<bool>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn report_error(e: &Error) {
    eprintln!("Error: {e}");
    if let Some(stderr) = e.nft_stderr() {
        let translation = NftablesErrorPattern::match_error(stderr);
        eprintln!("{}", translation.user_message);
        for suggestion in &translation.suggestions {
            eprintln!("  - {suggestion}");
        }
        if let Some(url) = &translation.help_url {
            eprintln!("  See: {url}");
        }
    }
}

/// Maps command line families, dropping repeats such as `v4,ip`.
fn unique_families(families: impl IntoIterator<Item = TableFamily>) -> Vec<TableFamily> {
    let mut seen = BTreeSet::new();
    families.into_iter().filter(|family| seen.insert(*family)).collect()
}

/// Resolves command line families against the configured defaults.
fn resolve_families(args: &[FamilyArg], config: &AppConfig) -> Vec<TableFamily> {
    if !args.is_empty() {
        return unique_families(args.iter().copied().map(TableFamily::from));
    }
    if !config.default_families.is_empty() {
        return unique_families(config.default_families.iter().copied());
    }
    vec![TableFamily::Ipv4, TableFamily::Ipv6]
}

/// Applies the changes given to `config`; returns whether anything was given.
fn apply_config_changes(
    config: &mut AppConfig,
    family: &[FamilyArg],
    nat_table: Option<String>,
    json: Option<bool>,
) -> bool {
    let mut changed = false;
    if !family.is_empty() {
        config.default_families = unique_families(family.iter().copied().map(TableFamily::from));
        changed = true;
    }
    if let Some(nat_table) = nat_table {
        config.nat_table = nat_table;
        changed = true;
    }
    if let Some(json) = json {
        config.json_output = json;
        changed = true;
    }
    changed
}

async fn handle_cli(command: Commands) -> Result<()> {
    let mut config = config::load_config().await;

    match command {
        Commands::Dump { query, table } => {
            let families = resolve_families(&query.family, &config);
            let json = query.json || config.json_output;
            match &query.from {
                Some(path) => {
                    let snapshot = Snapshot::load(path).await?;
                    dump(&snapshot, &families, &table, json).await
                }
                None => dump(&NftSource::new(), &families, &table, json).await,
            }
        }
        Commands::Ports { query, nat_table } => {
            let families = resolve_families(&query.family, &config);
            let nat_table = nat_table.unwrap_or(config.nat_table);
            let json = query.json || config.json_output;
            match &query.from {
                Some(path) => {
                    let snapshot = Snapshot::load(path).await?;
                    ports(&snapshot, &families, &nat_table, json).await
                }
                None => ports(&NftSource::new(), &families, &nat_table, json).await,
            }
        }
        Commands::Snapshot { output } => capture(output.as_deref()).await,
        Commands::Config {
            family,
            nat_table,
            json,
        } => {
            if apply_config_changes(&mut config, &family, nat_table, json) {
                config::save_config(&config).await?;
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn dump<S: RulesetSource>(
    source: &S,
    families: &[TableFamily],
    table_names: &[String],
    json: bool,
) -> Result<()> {
    let tables = build_hierarchy(source, families).await?;
    if json {
        let selected: Vec<_> = tables
            .tables()
            .filter(|t| table_names.is_empty() || table_names.iter().any(|n| n == t.name()))
            .collect();
        println!("{}", serde_json::to_string_pretty(&selected)?);
    } else {
        print!("{}", render_dump(&tables, table_names));
    }
    Ok(())
}

async fn ports<S: RulesetSource>(
    source: &S,
    families: &[TableFamily],
    nat_table: &str,
    json: bool,
) -> Result<()> {
    let tables = build_hierarchy(source, families).await?;
    // "all" searches the NAT table of every concrete family
    let search: Vec<TableFamily> = if families.contains(&TableFamily::Unspecified) {
        TableFamily::iter()
            .filter(|f| *f != TableFamily::Unspecified)
            .collect()
    } else {
        families.to_vec()
    };

    let forwards = forwarded_ports(&tables, &search, nat_table);
    if json {
        println!("{}", serde_json::to_string_pretty(&forwards)?);
    } else {
        print!("{}", render_ports(&forwards));
    }
    Ok(())
}

async fn capture(output: Option<&Path>) -> Result<()> {
    let snapshot = Snapshot::capture(&NftSource::new()).await?;
    let path = match output {
        Some(path) => {
            snapshot.save_to(path).await?;
            path.to_path_buf()
        }
        None => snapshot.save().await?,
    };
    println!("{}", path.display());
    Ok(())
}
