//! Offline captures of the rule base
//!
//! A [`Snapshot`] records the flat listings of one moment (tables, chains and
//! the rules of every chain) so they can be inspected later, on another host,
//! or without privileges. It implements [`RulesetSource`] itself, so the
//! hierarchy builders and the port finder work on it unchanged.
//!
//! Files are JSON, written atomically with mode 0600 and carry a SHA-256
//! checksum over their content that is verified on load.

use crate::core::error::{Error, Result, SnapshotError};
use crate::core::family::TableFamily;
use crate::core::source::{ChainInfo, RuleInfo, RulesetSource, TableInfo, TableKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Format version written by this build
pub const SNAPSHOT_VERSION: u32 = 1;

/// Timestamped snapshots kept in the state directory
pub const MAX_SNAPSHOTS: usize = 5;

/// The rules of one chain as captured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRules {
    pub table: TableKey,
    pub chain: String,
    pub rules: Vec<RuleInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    /// Hex SHA-256 of the content, see [`Snapshot::compute_checksum`]
    #[serde(default)]
    pub checksum: String,
    pub tables: Vec<TableInfo>,
    pub chains: Vec<ChainInfo>,
    pub rules: Vec<ChainRules>,
}

/// Everything the checksum covers
#[derive(Serialize)]
struct SnapshotContent<'a> {
    version: u32,
    created_at: &'a DateTime<Utc>,
    tables: &'a [TableInfo],
    chains: &'a [ChainInfo],
    rules: &'a [ChainRules],
}

impl Snapshot {
    /// Records the listings of `source`.
    ///
    /// Chains whose rules cannot be fetched are left out, like the hierarchy
    /// builders do.
    pub async fn capture<S: RulesetSource>(source: &S) -> Result<Self> {
        let tables = source
            .list_tables()
            .await
            .map_err(|e| Error::query("tables", e))?;
        let listed = source
            .list_chains()
            .await
            .map_err(|e| Error::query("chains", e))?;

        let mut chains = Vec::with_capacity(listed.len());
        let mut rules = Vec::with_capacity(listed.len());
        for chain in listed {
            let table = chain.table_key();
            match source.get_rules(&table, &chain.name).await {
                Ok(chain_rules) => {
                    rules.push(ChainRules {
                        table,
                        chain: chain.name.clone(),
                        rules: chain_rules,
                    });
                    chains.push(chain);
                }
                Err(e) => warn!("Not capturing chain {:?} of table {}: {}", chain.name, table, e),
            }
        }

        let mut snapshot = Self {
            version: SNAPSHOT_VERSION,
            created_at: Utc::now(),
            checksum: String::new(),
            tables,
            chains,
            rules,
        };
        snapshot.checksum = snapshot.compute_checksum()?;
        info!(
            "Captured {} table(s), {} chain(s)",
            snapshot.tables.len(),
            snapshot.chains.len()
        );
        Ok(snapshot)
    }

    /// Computes the SHA-256 checksum over the canonical JSON of the content.
    pub fn compute_checksum(&self) -> Result<String> {
        let content = SnapshotContent {
            version: self.version,
            created_at: &self.created_at,
            tables: &self.tables,
            chains: &self.chains,
            rules: &self.rules,
        };
        let json_str = serde_json::to_string(&content)?;
        let mut hasher = Sha256::new();
        hasher.update(json_str.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Checks format version and checksum.
    pub fn verify(&self) -> Result<()> {
        if self.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::VersionMismatch {
                found: self.version,
                expected: SNAPSHOT_VERSION,
            }
            .into());
        }
        let actual = self.compute_checksum()?;
        if actual != self.checksum {
            return Err(SnapshotError::ChecksumMismatch {
                expected: self.checksum.clone(),
                actual,
            }
            .into());
        }
        Ok(())
    }

    /// Saves the snapshot into the state directory under a timestamped name.
    pub async fn save(&self) -> Result<PathBuf> {
        let state_dir = crate::utils::get_state_dir()
            .ok_or_else(|| Error::Internal("Failed to get state directory".to_string()))?;
        crate::utils::ensure_dirs()?;
        self.save_in(&state_dir).await
    }

    /// Saves the snapshot into `dir` under a timestamped name, keeping only
    /// the newest [`MAX_SNAPSHOTS`] snapshots there.
    pub async fn save_in(&self, dir: &Path) -> Result<PathBuf> {
        let timestamp = self.created_at.format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("snapshot_{timestamp}.json"));
        self.save_to(&path).await?;
        cleanup_old_snapshots(dir).await?;
        Ok(path)
    }

    /// Writes the snapshot to `path` atomically with mode 0600.
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        let written = match write_private(&temp_path, json.as_bytes()).await {
            Ok(()) => tokio::fs::rename(&temp_path, path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(remove_err) = tokio::fs::remove_file(&temp_path).await {
                debug!("Could not remove {}: {}", temp_path.display(), remove_err);
            }
            return Err(e.into());
        }
        info!("Snapshot saved to {}", path.display());
        Ok(())
    }

    /// Loads and verifies a snapshot file.
    pub async fn load(path: &Path) -> Result<Self> {
        let json = match tokio::fs::read_to_string(path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::NotFound(path.display().to_string()).into());
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: Self = serde_json::from_str(&json)?;
        snapshot.verify()?;
        Ok(snapshot)
    }
}

async fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    #[cfg(unix)]
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .await?;

    #[cfg(not(unix))]
    let mut file = tokio::fs::File::create(path).await?;

    file.write_all(data).await?;
    file.sync_all().await
}

/// Lists the timestamped snapshots in `dir`, newest first.
pub async fn list_snapshots(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut snapshots = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_snapshot = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("snapshot_") && n.ends_with(".json"));
        if is_snapshot {
            snapshots.push(path);
        }
    }
    // names embed the capture time, so they sort chronologically
    snapshots.sort_by(|a, b| b.cmp(a));
    Ok(snapshots)
}

async fn cleanup_old_snapshots(dir: &Path) -> Result<()> {
    let snapshots = list_snapshots(dir).await?;
    for snapshot in snapshots.iter().skip(MAX_SNAPSHOTS) {
        match tokio::fs::remove_file(snapshot).await {
            Ok(()) => info!("Removed old snapshot: {}", snapshot.display()),
            Err(e) => warn!("Failed to remove old snapshot {}: {}", snapshot.display(), e),
        }
    }
    Ok(())
}

impl RulesetSource for Snapshot {
    async fn list_tables(&self) -> Result<Vec<TableInfo>> {
        Ok(self.tables.clone())
    }

    async fn list_chains(&self) -> Result<Vec<ChainInfo>> {
        Ok(self.chains.clone())
    }

    async fn list_chains_for_family(&self, family: TableFamily) -> Result<Vec<ChainInfo>> {
        Ok(self
            .chains
            .iter()
            .filter(|chain| family == TableFamily::Unspecified || chain.family == family)
            .cloned()
            .collect())
    }

    async fn get_rules(&self, table: &TableKey, chain: &str) -> Result<Vec<RuleInfo>> {
        self.rules
            .iter()
            .find(|captured| &captured.table == table && captured.chain == chain)
            .map(|captured| captured.rules.clone())
            .ok_or_else(|| Error::ChainNotFound {
                table: table.name.clone(),
                family: table.family.to_string(),
                chain: chain.to_string(),
            })
    }
}
