//! Configuration management for Folio
//!
//! This crate handles loading and validating `.folio/config.toml`. Every field
//! has a default, so a missing file or a partial file is always usable.

use folio_common::{FolioError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory holding configuration and state, relative to the workspace root
pub const FOLIO_DIR: &str = ".folio";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FolioConfig {
    /// Workspace root (set programmatically, not in TOML)
    #[serde(skip)]
    pub root: PathBuf,

    /// Reload and retry timings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Input ceilings enforced before any local mutation
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Persisted state location
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Sync configuration ([sync])
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
    /// Full refresh interval after a successful fetch
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Lower bound of the randomized retry after a failed fetch
    #[serde(default = "default_reload_retry_min")]
    pub reload_retry_min_secs: u64,

    /// Upper bound of the randomized retry after a failed fetch
    #[serde(default = "default_reload_retry_max")]
    pub reload_retry_max_secs: u64,

    /// First backoff step for a transiently failing mutation round trip
    #[serde(default = "default_retry_initial")]
    pub retry_initial_ms: u64,

    /// Backoff ceiling for mutation round trips
    #[serde(default = "default_retry_cap")]
    pub retry_cap_ms: u64,
}

fn default_refresh_interval() -> u64 {
    86_400
}
fn default_reload_retry_min() -> u64 {
    60
}
fn default_reload_retry_max() -> u64 {
    300
}
fn default_retry_initial() -> u64 {
    500
}
fn default_retry_cap() -> u64 {
    60_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval(),
            reload_retry_min_secs: default_reload_retry_min(),
            reload_retry_max_secs: default_reload_retry_max(),
            retry_initial_ms: default_retry_initial(),
            retry_cap_ms: default_retry_cap(),
        }
    }
}

impl SyncConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn reload_retry_window(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.reload_retry_min_secs),
            Duration::from_secs(self.reload_retry_max_secs),
        )
    }

    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms)
    }

    pub fn retry_cap(&self) -> Duration {
        Duration::from_millis(self.retry_cap_ms)
    }
}

/// Limits configuration ([limits])
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitsConfig {
    /// Maximum filter title length in characters
    #[serde(default = "default_max_title_length")]
    pub max_title_length: usize,

    /// Maximum icon name length in characters
    #[serde(default = "default_max_icon_length")]
    pub max_icon_length: usize,

    /// Maximum distinct included + excluded dialogs per filter
    #[serde(default = "default_max_filter_dialogs")]
    pub max_filter_dialogs: usize,

    /// Maximum number of filters
    #[serde(default = "default_max_filters")]
    pub max_filters: usize,

    /// Maximum invite link name length in characters
    #[serde(default = "default_max_invite_link_name_length")]
    pub max_invite_link_name_length: usize,
}

fn default_max_title_length() -> usize {
    12
}
fn default_max_icon_length() -> usize {
    32
}
fn default_max_filter_dialogs() -> usize {
    100
}
fn default_max_filters() -> usize {
    20
}
fn default_max_invite_link_name_length() -> usize {
    32
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_title_length: default_max_title_length(),
            max_icon_length: default_max_icon_length(),
            max_filter_dialogs: default_max_filter_dialogs(),
            max_filters: default_max_filters(),
            max_invite_link_name_length: default_max_invite_link_name_length(),
        }
    }
}

/// Storage configuration ([storage])
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// Persisted filter state, relative to the workspace root
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

fn default_state_file() -> PathBuf {
    PathBuf::from(".folio/state/filters.json")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
        }
    }
}

impl FolioConfig {
    /// Path of the configuration file inside a workspace
    pub fn config_path(workspace_root: &Path) -> PathBuf {
        workspace_root.join(FOLIO_DIR).join("config.toml")
    }

    /// Load configuration from workspace root
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let config_path = Self::config_path(workspace_root);

        if !config_path.exists() {
            tracing::debug!("No config at {:?}, using defaults", config_path);
            return Ok(Self {
                root: workspace_root.to_path_buf(),
                ..Self::default()
            });
        }

        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| FolioError::Config(format!("Failed to read config: {}", e)))?;

        let mut config = Self::from_toml_str(&content)?;
        config.root = workspace_root.to_path_buf();
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: FolioConfig = toml::from_str(content)
            .map_err(|e| FolioError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML (used by `folio init`)
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| FolioError::Config(format!("Failed to render config: {}", e)))
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        let sync = &self.sync;
        if sync.refresh_interval_secs == 0 {
            return Err(FolioError::Config(
                "sync.refresh_interval_secs must be positive".to_string(),
            ));
        }
        if sync.reload_retry_min_secs > sync.reload_retry_max_secs {
            return Err(FolioError::Config(format!(
                "sync.reload_retry_min_secs ({}) exceeds sync.reload_retry_max_secs ({})",
                sync.reload_retry_min_secs, sync.reload_retry_max_secs
            )));
        }
        if sync.retry_initial_ms == 0 || sync.retry_initial_ms > sync.retry_cap_ms {
            return Err(FolioError::Config(
                "sync.retry_initial_ms must be positive and not exceed sync.retry_cap_ms"
                    .to_string(),
            ));
        }

        let limits = &self.limits;
        if limits.max_title_length == 0 || limits.max_filter_dialogs == 0 {
            return Err(FolioError::Config(
                "limits.max_title_length and limits.max_filter_dialogs must be positive"
                    .to_string(),
            ));
        }
        let id_capacity = (folio_common::FilterId::MAX - folio_common::FilterId::MIN + 1) as usize;
        if limits.max_filters == 0 || limits.max_filters > id_capacity {
            return Err(FolioError::Config(format!(
                "limits.max_filters must be within 1..={}",
                id_capacity
            )));
        }
        Ok(())
    }

    /// Absolute path of the persisted state record
    pub fn state_path(&self) -> PathBuf {
        if self.storage.state_file.is_absolute() {
            self.storage.state_file.clone()
        } else {
            self.root.join(&self.storage.state_file)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    #[test]
    fn test_defaults_without_file() {
        let temp = assert_fs::TempDir::new().unwrap();
        let config = FolioConfig::load(temp.path()).unwrap();

        assert_eq!(config.root, temp.path());
        assert_eq!(config.sync.refresh_interval(), Duration::from_secs(86_400));
        assert_eq!(config.limits.max_title_length, 12);
        assert_eq!(config.limits.max_filter_dialogs, 100);
        assert_eq!(
            config.state_path(),
            temp.path().join(".folio/state/filters.json")
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child(".folio/config.toml")
            .write_str("[limits]\nmax_filters = 10\n\n[sync]\nrefresh_interval_secs = 3600\n")
            .unwrap();

        let config = FolioConfig::load(temp.path()).unwrap();
        assert_eq!(config.limits.max_filters, 10);
        assert_eq!(config.limits.max_title_length, 12);
        assert_eq!(config.sync.refresh_interval_secs, 3600);
        assert_eq!(config.sync.reload_retry_max_secs, 300);
    }

    #[test]
    fn test_rejects_inverted_retry_window() {
        let err = FolioConfig::from_toml_str(
            "[sync]\nreload_retry_min_secs = 600\nreload_retry_max_secs = 60\n",
        )
        .unwrap_err();
        assert!(matches!(err, FolioError::Config(_)));
    }

    #[test]
    fn test_rejects_too_many_filters() {
        let err = FolioConfig::from_toml_str("[limits]\nmax_filters = 1000\n").unwrap_err();
        assert!(err.to_string().contains("max_filters"));
    }

    #[test]
    fn test_malformed_toml() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child(".folio/config.toml").write_str("[sync\n").unwrap();
        let err = FolioConfig::load(temp.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_render_round_trips() {
        let rendered = FolioConfig::default().to_toml_string().unwrap();
        let parsed = FolioConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.sync, SyncConfig::default());
        assert_eq!(parsed.limits, LimitsConfig::default());
    }
}
