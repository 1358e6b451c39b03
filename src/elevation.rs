//! Privilege elevation for system operations
//!
//! Listing the netfilter rule base requires `CAP_NET_ADMIN`. nftscope runs as
//! an unprivileged user and only elevates the `nft` queries it issues.
//!
//! # Elevation Strategy
//!
//! - **Preferred**: Uses `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: Uses `sudo` when stdin is a TTY
//! - **Non-interactive fallback**: Uses `pkexec`
//!
//! # Environment Variables
//!
//! - `NFTSCOPE_ELEVATION_METHOD`: Force a specific elevation method (`sudo`, `run0`, or `pkexec`).
//!   Example: `NFTSCOPE_ELEVATION_METHOD=sudo nftscope ports`
//! - `NFTSCOPE_NO_ELEVATION`: Run `nft` directly without any elevation.
//! - `NFTSCOPE_NFT_COMMAND`: Path of the `nft` binary to run (defaults to `nft` in PATH).
//!
//! # Example
//!
//! ```no_run
//! use nftscope::elevation::create_elevated_nft_command;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cmd = create_elevated_nft_command(&["--json", "list", "tables"])?;
//! let output = cmd.output().await?;
//! # Ok(())
//! # }
//! ```

use std::io;
use tokio::process::Command;

pub const ENV_ELEVATION_METHOD: &str = "NFTSCOPE_ELEVATION_METHOD";
pub const ENV_NO_ELEVATION: &str = "NFTSCOPE_NO_ELEVATION";
pub const ENV_NFT_COMMAND: &str = "NFTSCOPE_NFT_COMMAND";

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `NFTSCOPE_ELEVATION_METHOD`
    #[error("Invalid NFTSCOPE_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Elevation tools that may wrap the `nft` invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ElevationMethod {
    Sudo,
    Run0,
    Pkexec,
}

impl ElevationMethod {
    /// Reads the forced method from the environment; empty means automatic.
    pub fn from_env() -> Result<Option<Self>, ElevationError> {
        match std::env::var(ENV_ELEVATION_METHOD) {
            Ok(method) if !method.is_empty() => method
                .parse()
                .map(Some)
                .map_err(|_| ElevationError::InvalidMethod(method.to_lowercase())),
            _ => Ok(None),
        }
    }

    fn wrap(self, program: &str, args: &[&str]) -> Command {
        let mut cmd = Command::new(self.to_string());
        cmd.arg(program).args(args);
        cmd
    }
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Returns the `nft` program to run, honoring `NFTSCOPE_NFT_COMMAND`.
pub fn nft_program() -> String {
    std::env::var(ENV_NFT_COMMAND)
        .ok()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "nft".to_string())
}

fn build_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    if std::env::var(ENV_NO_ELEVATION).is_ok() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // A bad override is reported even when no elevation would be needed
    let forced = ElevationMethod::from_env()?;

    if nix::unistd::getuid().is_root() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    if let Some(method) = forced {
        let name = method.to_string();
        if !binary_exists(&name) {
            return Err(ElevationError::MethodNotAvailable(name));
        }
        return Ok(method.wrap(program, args));
    }

    if binary_exists("run0") {
        return Ok(ElevationMethod::Run0.wrap(program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        Ok(ElevationMethod::Sudo.wrap(program, args))
    } else {
        if !binary_exists("pkexec") {
            return Err(ElevationError::PkexecNotFound);
        }
        Ok(ElevationMethod::Pkexec.wrap(program, args))
    }
}

/// Creates an elevated `nft` command with the specified arguments
///
/// Arguments are passed directly to `nft` without shell interpretation.
///
/// # Elevation Strategy
///
/// 1. `NFTSCOPE_NO_ELEVATION` set, or running as root: `nft` directly
/// 2. `NFTSCOPE_ELEVATION_METHOD` set: that method, if installed
/// 3. Otherwise `run0`, then `sudo` on a terminal, then `pkexec`
///
/// # Errors
///
/// Returns [`ElevationError`] if the forced method is unknown or no
/// elevation tool is available.
pub fn create_elevated_nft_command(args: &[&str]) -> Result<Command, ElevationError> {
    build_elevated_command(&nft_program(), args)
}
