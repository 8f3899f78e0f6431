//! Point-in-time backups of workspace content.
//!
//! [`BackupStorage`] does the synchronous artifact and record work against a
//! [`StorageBackend`](crate::storage::StorageBackend). [`BackupProfile`] is
//! the per-workspace async façade that serializes operations and enforces
//! retention, and [`BackupService`] hands out profiles and runs the optional
//! auto-backup timer.

mod profile;
mod scheduler;
mod service;
mod storage;

pub use profile::BackupProfile;
pub use scheduler::AutoBackupScheduler;
pub use service::BackupService;
pub use storage::BackupStorage;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable record of one backup artifact.
///
/// Holds only the id of its workspace; a handle stays valid (and deletable)
/// after the workspace itself is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub workspace_id: Uuid,
    /// Creation time in epoch milliseconds.
    pub created_at: i64,
    pub key: String,
    pub size: u64,
    /// Hex-encoded SHA-256 of the artifact.
    pub checksum: String,
}

impl Backup {
    /// Storage key for a backup, unique per workspace and timestamp.
    pub fn key_for(workspace_id: Uuid, created_at: i64) -> String {
        format!("{workspace_id}-{created_at}")
    }

    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.created_at).single()
    }
}
