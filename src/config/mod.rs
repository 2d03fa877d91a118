//! Configuration module for livecap
//!
//! Loads config from `$XDG_CONFIG_HOME/livecap/config.toml` or `~/.config/livecap/config.toml`.
//! Falls back to embedded defaults if file doesn't exist.
//! Partial configs are merged with defaults using serde's default attributes.
//!
//! # Example
//!
//! ```no_run
//! use livecap::config::Config;
//!
//! let config = Config::load().expect("Failed to load config");
//! println!("Manifest: {}", config.models.effective_manifest_url());
//! println!("Download timeout: {}s", config.models.download_timeout_secs);
//! ```

pub mod schema;

pub use schema::{Config, ModelsConfig, UpdatesConfig};
