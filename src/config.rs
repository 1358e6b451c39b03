use crate::core::family::TableFamily;
use crate::utils::get_data_dir;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name of the NAT table port forwards are searched in by default
pub const DEFAULT_NAT_TABLE: &str = "nat";

/// Persisted user defaults for the CLI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Families queried when `--family` is not given; empty means all
    #[serde(default)]
    pub default_families: Vec<TableFamily>,
    #[serde(default = "default_nat_table")]
    pub nat_table: String,
    /// Print JSON instead of text unless overridden on the command line
    #[serde(default)]
    pub json_output: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_families: Vec::new(),
            nat_table: default_nat_table(),
            json_output: false,
        }
    }
}

fn default_nat_table() -> String {
    DEFAULT_NAT_TABLE.to_string()
}

/// Saves the config to `path` using an atomic write pattern.
/// 1. Writes to a temporary file created with mode 0o600.
/// 2. Atomically renames it to the target path.
pub async fn save_config_to(config: &AppConfig, path: &Path) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let json = serde_json::to_string_pretty(config)?;
    let temp_path = path.with_extension("json.tmp");

    #[cfg(unix)]
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(&temp_path)
        .await?;

    #[cfg(not(unix))]
    let mut file = tokio::fs::File::create(&temp_path).await?;

    file.write_all(json.as_bytes()).await?;
    file.sync_all().await?;

    tokio::fs::rename(temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// Saves the config as `config.json` in the data directory.
pub async fn save_config(config: &AppConfig) -> std::io::Result<()> {
    if let Some(path) = get_data_dir() {
        crate::utils::ensure_dirs()?;
        save_config_to(config, &path.join("config.json")).await?;
    }
    Ok(())
}

/// Loads the config from `path`, or returns the defaults if it is missing or
/// unreadable.
pub async fn load_config_from(path: &Path) -> AppConfig {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
            tracing::warn!("Ignoring invalid config {}: {e}", path.display());
            AppConfig::default()
        }),
        Err(_) => AppConfig::default(),
    }
}

/// Loads the config from the data directory, or returns the defaults.
pub async fn load_config() -> AppConfig {
    match get_data_dir() {
        Some(path) => load_config_from(&path.join("config.json")).await,
        None => AppConfig::default(),
    }
}
