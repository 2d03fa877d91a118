use thiserror::Error;

/// Main error type for livecap
#[derive(Error, Debug)]
pub enum LivecapError {
    #[error("Network error: {0}\n\nTroubleshooting:\n- Check internet connection\n- Verify firewall/proxy settings\n- Use Retry once the connection is back")]
    Network(String),

    #[error("Model manifest is invalid: {0}")]
    ManifestInvalid(String),

    #[error("Model manifest is empty: no usable model entries found")]
    ManifestEmpty,

    #[error("Download failed: {0}\n\nTroubleshooting:\n- Check internet connection\n- Ensure enough free disk space in the models folder\n- Retry; downloads restart from the beginning")]
    DownloadFailed(String),

    #[error("Failed to finalize download: {0}")]
    FinalizeFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Model '{id}' removed from index, but its file could not be deleted: {reason}")]
    FileRemovalFailed { id: String, reason: String },

    #[error("Config error: {0}\n\nTroubleshooting:\n- Check config file: ~/.config/livecap/config.toml\n- Run with RUST_LOG=debug for more details")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, LivecapError>;
