use thiserror::Error;

/// Core error types for nftscope
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// nftables command execution failed
    #[error("nftables error: {message}")]
    Nftables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// A listing of the rule base could not be obtained at all
    #[error("cannot query netfilter {what}: {source}")]
    Query {
        what: String,
        #[source]
        source: Box<Error>,
    },

    /// A chain asked for by name is not (or no longer) present
    #[error("chain {chain:?} not found in table {table:?} ({family})")]
    ChainNotFound {
        table: String,
        family: String,
        chain: String,
    },

    /// Snapshot operation failed
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wraps a listing failure, keeping the underlying cause.
    pub fn query(what: impl Into<String>, source: Error) -> Self {
        Self::Query {
            what: what.into(),
            source: Box::new(source),
        }
    }

    /// Returns the nft stderr text at the root of this error, if any.
    pub fn nft_stderr(&self) -> Option<&str> {
        match self {
            Self::Nftables { stderr, .. } => stderr.as_deref(),
            Self::Query { source, .. } => source.nft_stderr(),
            _ => None,
        }
    }
}

/// Snapshot-specific errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("Snapshot format version mismatch: found v{found}, expected v{expected}")]
    VersionMismatch { found: u32, expected: u32 },
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of nftables error patterns and their translations
pub struct NftablesErrorPattern;

impl NftablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to read the netfilter rule base")
                .with_suggestion("Run as root, or let nftscope elevate via run0/sudo/pkexec")
                .with_suggestion("Set NFTSCOPE_ELEVATION_METHOD=sudo to force a specific method")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Quick_reference-nftables_in_10_minutes");
        }

        if lower.contains("cache initialization failed") {
            return ErrorTranslation::new(
                "Failed to initialize nftables cache - insufficient privileges",
            )
            .with_suggestion("This usually means you need elevated privileges")
            .with_suggestion("Alternatively inspect a saved capture with --from <snapshot>")
            .with_help("https://wiki.archlinux.org/title/Polkit");
        }

        if lower.contains("command not found")
            || (lower.contains("no such file") && !lower.contains("list"))
        {
            return ErrorTranslation::new("nftables is not installed or not found in PATH")
                .with_suggestion("Install nftables: sudo apt install nftables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install nftables  (Fedora/RHEL)")
                .with_suggestion("Or: sudo pacman -S nftables  (Arch)")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Main_Page");
        }

        if lower.contains("no such file") || lower.contains("does not exist") {
            return ErrorTranslation::new("Table or chain vanished while it was being listed")
                .with_suggestion("Another process modified the rule base concurrently")
                .with_suggestion("Run the query again to obtain a fresh snapshot");
        }

        if lower.contains("resource busy") || lower.contains("device or resource busy") {
            return ErrorTranslation::new("Netfilter resource is busy")
                .with_suggestion("Another process may be modifying nftables")
                .with_suggestion("Wait a moment and try again");
        }

        if lower.contains("netlink") {
            return ErrorTranslation::new("Communication error with kernel netlink interface")
                .with_suggestion("The kernel's netlink interface is not responding")
                .with_suggestion("Check kernel modules: lsmod | grep nf_tables")
                .with_suggestion("Load nf_tables module: sudo modprobe nf_tables")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Troubleshooting");
        }

        ErrorTranslation::new(format!("Netfilter query error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify nftables is working: sudo nft list ruleset")
            .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Troubleshooting")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
