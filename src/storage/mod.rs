//! Durable persistence for workspace records, backup records and blobs.
//!
//! A backend stores two kinds of things: small *records* (one per workspace,
//! one per backup) and opaque *blobs* (workspace content and backup
//! artifacts). Writes to a single record or blob are atomic; callers rely on
//! that instead of implementing their own journaling.

mod factory;
mod flat_file;
mod memory;

pub use factory::{BackendFactory, BackendRegistry};
pub use flat_file::FlatFileBackend;
pub use memory::MemoryBackend;

use crate::config::RecordFormat;
use crate::BuildWorldError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Workspace,
    Backup,
}

impl RecordKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            RecordKind::Workspace => "workspaces",
            RecordKind::Backup => "backups",
        }
    }
}

/// Location of a blob inside a backend, always a relative `/`-separated path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobKey(String);

impl BlobKey {
    /// Live content of a workspace.
    pub fn content(workspace_id: Uuid) -> Self {
        Self(format!("content/{workspace_id}"))
    }

    pub fn backup(backup_key: &str) -> Self {
        Self(format!("backups/{backup_key}"))
    }

    /// Scratch location a restore is written to before being swapped in.
    pub fn staging(workspace_id: Uuid) -> Self {
        Self(format!("staging/{workspace_id}-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rejects keys that could escape the backend root.
pub(crate) fn validate_key(key: &str) -> crate::Result<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(BuildWorldError::Storage(format!("invalid storage key '{key}'")));
    }
    Ok(())
}

pub trait StorageBackend: Send + Sync {
    /// Tag this backend was registered under.
    fn name(&self) -> &str;

    fn put_record(&self, kind: RecordKind, key: &str, data: &[u8]) -> crate::Result<()>;
    fn get_record(&self, kind: RecordKind, key: &str) -> crate::Result<Option<Vec<u8>>>;
    /// Returns whether a record was actually removed.
    fn delete_record(&self, kind: RecordKind, key: &str) -> crate::Result<bool>;
    fn list_records(&self, kind: RecordKind) -> crate::Result<Vec<(String, Vec<u8>)>>;

    fn put_blob(&self, key: &BlobKey, data: &[u8]) -> crate::Result<()>;
    fn get_blob(&self, key: &BlobKey) -> crate::Result<Option<Vec<u8>>>;
    fn blob_exists(&self, key: &BlobKey) -> crate::Result<bool>;
    /// Returns whether a blob was actually removed.
    fn delete_blob(&self, key: &BlobKey) -> crate::Result<bool>;
    /// Copies `from` over `to`, returning the number of bytes copied.
    fn copy_blob(&self, from: &BlobKey, to: &BlobKey) -> crate::Result<u64>;
    /// Atomically replaces `to` with `from`.
    fn rename_blob(&self, from: &BlobKey, to: &BlobKey) -> crate::Result<()>;
}

/// Encodes persisted records in the configured format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordCodec {
    format: RecordFormat,
}

impl RecordCodec {
    pub fn new(format: RecordFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> RecordFormat {
        self.format
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> crate::Result<Vec<u8>> {
        Ok(match self.format {
            RecordFormat::Json => serde_json::to_vec_pretty(value)?,
            RecordFormat::Cbor => serde_cbor::to_vec(value)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> crate::Result<T> {
        Ok(match self.format {
            RecordFormat::Json => serde_json::from_slice(bytes)?,
            RecordFormat::Cbor => serde_cbor::from_slice(bytes)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::Backup;
    use crate::workspace::{Builder, Visibility, WorldType, Workspace};

    #[test]
    fn test_key_validation() {
        assert!(validate_key("content/abc").is_ok());
        assert!(validate_key("alpha").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("backups/../secrets").is_err());
        assert!(validate_key("a//b").is_err());
    }

    #[test]
    fn test_codecs_round_trip_records() {
        let mut ws = Workspace::new(
            "alpha",
            Some(Builder::new(Uuid::new_v4(), "owner")),
            WorldType::Template,
            Visibility::Private,
        );
        ws.add_builder(Builder::new(Uuid::new_v4(), "helper"));
        ws.display.material = Some("GRASS_BLOCK".to_string());
        let backup = Backup {
            workspace_id: ws.id,
            created_at: 1_700_000_000_123,
            key: Backup::key_for(ws.id, 1_700_000_000_123),
            size: 42,
            checksum: "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08".to_string(),
        };

        for format in [RecordFormat::Json, RecordFormat::Cbor] {
            let codec = RecordCodec::new(format);
            let bytes = codec.encode(&ws).unwrap();
            let back: Workspace = codec.decode(&bytes).unwrap();
            assert_eq!(back, ws, "format {format:?}");

            let bytes = codec.encode(&backup).unwrap();
            let back: Backup = codec.decode(&bytes).unwrap();
            assert_eq!(back, backup, "format {format:?}");
        }
    }
}
