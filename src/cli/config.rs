//! Configuration discovery and loading.
//!
//! Defaults for flags the user did not pass come from the first file found
//! in the hierarchy:
//!
//! 1. Current directory: `./shipyard.toml`
//! 2. User config: `~/.shipyard/config.toml`
//! 3. System config: `/etc/shipyard/config.toml`
//! 4. Built-in defaults

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File-provided defaults for deployment flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Defaults {
    /// Deployment state directory.
    pub base_dir: Option<PathBuf>,
    /// Host bind address for generated port mappings.
    pub bind_host: Option<String>,
    /// Retry attempts for registry/network failures.
    pub registry_retries: Option<u32>,
    /// Initial retry backoff in seconds.
    pub retry_backoff_seconds: Option<u64>,
}

impl Defaults {
    /// Load defaults from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file is unreadable or not valid TOML.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading defaults file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("parsing defaults file {}", path.display()))
    }
}

/// Configuration discovery over the candidate hierarchy.
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Load defaults from the first discovered file, or built-ins.
    pub fn discover() -> Defaults {
        if let Some(path) = Self::find_config_file() {
            info!("loading defaults from {}", path.display());
            match Defaults::from_toml_file(&path) {
                Ok(defaults) => return defaults,
                Err(e) => {
                    debug!("ignoring unreadable defaults file {}: {e}", path.display());
                }
            }
        }
        Defaults::default()
    }

    /// First existing config file in the hierarchy.
    pub fn find_config_file() -> Option<PathBuf> {
        Self::candidates().into_iter().find(|p| p.is_file())
    }

    /// Candidate config files in priority order.
    pub fn candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Ok(current_dir) = std::env::current_dir() {
            candidates.push(current_dir.join("shipyard.toml"));
        }
        if let Some(home) = std::env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(".shipyard").join("config.toml"));
        }
        candidates.push(PathBuf::from("/etc/shipyard/config.toml"));
        candidates
    }

    /// Print the discovery hierarchy and which file (if any) is in use.
    pub fn show_discovery_info() {
        println!("Configuration discovery order:");
        for candidate in Self::candidates() {
            let marker = if candidate.is_file() { "found" } else { "absent" };
            println!("  [{marker}] {}", candidate.display());
        }
        match Self::find_config_file() {
            Some(path) => println!("Using: {}", path.display()),
            None => println!("Using built-in defaults."),
        }
    }
}
