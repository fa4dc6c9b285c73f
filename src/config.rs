//! Configuration management for tarfs-monitor

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default attribute cache timeout: 1s
pub const DEFAULT_ATTR_TIMEOUT_MS: u64 = 1000;

/// Default entry cache timeout: 1s
pub const DEFAULT_ENTRY_TIMEOUT_MS: u64 = 1000;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Kernel caching policy
    pub cache: CacheConfig,

    /// Mount options
    pub mount: MountConfig,

    /// Archive interpretation
    pub archive: ArchiveConfig,
}

/// Kernel attribute/entry caching policy
///
/// Lookup misses are always answered with ENOENT and never cached, so there
/// is no negative timeout here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// How long the kernel may cache attributes (ms)
    pub attr_timeout_ms: u64,

    /// How long the kernel may cache name lookups (ms)
    pub entry_timeout_ms: u64,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MountConfig {
    /// Filesystem name shown in the mount table
    pub fsname: String,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Ask the kernel to unmount when the process exits
    pub auto_unmount: bool,

    /// Owner override; `None` preserves owners recorded in the archive
    pub owner: Option<Owner>,
}

/// Fixed ownership applied to every node
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// Archive interpretation settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Create missing parent directories instead of rejecting the archive
    pub synthesize_parents: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            attr_timeout_ms: DEFAULT_ATTR_TIMEOUT_MS,
            entry_timeout_ms: DEFAULT_ENTRY_TIMEOUT_MS,
        }
    }
}

impl CacheConfig {
    pub fn attr_timeout(&self) -> Duration {
        Duration::from_millis(self.attr_timeout_ms)
    }

    pub fn entry_timeout(&self) -> Duration {
        Duration::from_millis(self.entry_timeout_ms)
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            fsname: "tarfs".to_string(),
            allow_other: false,
            auto_unmount: false,
            owner: None,
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Default location of the config file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tarfs-monitor")
            .join("config.json")
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TARFS_ATTR_TIMEOUT_MS") {
            if let Ok(ms) = v.trim().parse::<u64>() {
                self.cache.attr_timeout_ms = ms;
            }
        }

        if let Ok(v) = std::env::var("TARFS_ENTRY_TIMEOUT_MS") {
            if let Ok(ms) = v.trim().parse::<u64>() {
                self.cache.entry_timeout_ms = ms;
            }
        }

        if let Ok(v) = std::env::var("TARFS_ALLOW_OTHER") {
            match v.trim() {
                "1" | "true" | "yes" => self.mount.allow_other = true,
                "0" | "false" | "no" => self.mount.allow_other = false,
                _ => {}
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.mount.fsname.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "Filesystem name must not be empty".to_string(),
            ));
        }

        if self.mount.fsname.contains(',') {
            return Err(Error::InvalidConfig(
                "Filesystem name must not contain ','".to_string(),
            ));
        }

        Ok(())
    }
}
