use crate::error::BuildWorldError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Serialization used for persisted workspace and backup records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    #[default]
    Json,
    Cbor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Tag resolved through the backend registry, e.g. "flat-file" or "memory".
    pub backend: String,
    pub data_dir: PathBuf,
    pub record_format: RecordFormat,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "flat-file".to_string(),
            data_dir: default_data_dir(),
            record_format: RecordFormat::Json,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoBackupConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Only back up workspaces edited since their newest backup.
    pub only_modified: bool,
}

impl Default for AutoBackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 30 * 60,
            only_modified: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub max_backups_per_workspace: usize,
    /// Keep backup artifacts around after their workspace is deleted.
    pub retain_orphaned_backups: bool,
    pub auto_backup: AutoBackupConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            max_backups_per_workspace: 5,
            retain_orphaned_backups: false,
            auto_backup: AutoBackupConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub channel_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { channel_capacity: 256 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BuildWorldConfig {
    pub storage: StorageConfig,
    pub backup: BackupConfig,
    pub events: EventConfig,
}

impl BuildWorldConfig {
    /// Read a JSON config file. Missing fields fall back to their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            BuildWorldError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Config rooted at `data_dir`, otherwise default.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.data_dir = data_dir.into();
        config
    }

    pub fn apply_env_overrides(mut self) -> crate::Result<Self> {
        if let Ok(dir) = std::env::var("BUILDWORLD_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Ok(backend) = std::env::var("BUILDWORLD_BACKEND") {
            self.storage.backend = backend;
        }
        if let Ok(max) = std::env::var("BUILDWORLD_MAX_BACKUPS") {
            self.backup.max_backups_per_workspace = max.parse().map_err(|_| {
                BuildWorldError::Configuration(format!("BUILDWORLD_MAX_BACKUPS is not a number: {max}"))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.backup.max_backups_per_workspace == 0 {
            return Err(BuildWorldError::Configuration(
                "backup.max_backups_per_workspace must be at least 1".to_string(),
            ));
        }
        if self.backup.auto_backup.enabled && self.backup.auto_backup.interval_secs == 0 {
            return Err(BuildWorldError::Configuration(
                "backup.auto_backup.interval_secs must be positive".to_string(),
            ));
        }
        if self.events.channel_capacity == 0 {
            return Err(BuildWorldError::Configuration(
                "events.channel_capacity must be positive".to_string(),
            ));
        }
        if self.storage.backend.trim().is_empty() {
            return Err(BuildWorldError::Configuration("storage.backend is empty".to_string()));
        }
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    if cfg!(target_os = "windows") {
        std::env::var("LOCALAPPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("buildworld")
    } else if cfg!(target_os = "macos") {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("Library/Application Support/buildworld")
    } else {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".local/share/buildworld")
    }
}
