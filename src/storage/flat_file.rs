use super::{validate_key, BlobKey, RecordKind, StorageBackend};
use crate::BuildWorldError;
use rand::{thread_rng, Rng};
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use tracing::debug;

const TMP_PREFIX: &str = ".tmp_buildworld";

/// Backend storing each record and blob as its own file below `root`.
///
/// Layout: `records/<kind>/<key>` and `blobs/<key>`.
pub struct FlatFileBackend {
    root: PathBuf,
}

impl FlatFileBackend {
    pub fn new(root: impl Into<PathBuf>) -> crate::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("records"))?;
        fs::create_dir_all(root.join("blobs"))?;
        debug!(root = %root.display(), "opened flat-file storage");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_dir(&self, kind: RecordKind) -> PathBuf {
        self.root.join("records").join(kind.dir_name())
    }

    fn record_path(&self, kind: RecordKind, key: &str) -> crate::Result<PathBuf> {
        validate_key(key)?;
        if key.contains('/') {
            return Err(BuildWorldError::Storage(format!("record key '{key}' may not contain '/'")));
        }
        Ok(self.record_dir(kind).join(key))
    }

    fn blob_path(&self, key: &BlobKey) -> crate::Result<PathBuf> {
        validate_key(key.as_str())?;
        Ok(key.as_str().split('/').fold(self.root.join("blobs"), |path, part| path.join(part)))
    }

    // Writes to a temporary sibling and renames it into place, so readers
    // never observe a half-written file.
    fn atomic_write(path: &Path, bytes: &[u8]) -> crate::Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| BuildWorldError::Storage(format!("invalid path {}", path.display())))?;
        fs::create_dir_all(parent)?;
        let suffix: u64 = thread_rng().gen();
        let tmp = parent.join(format!("{TMP_PREFIX}.{suffix}.tmp"));

        let write = || -> io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, path)
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn read_optional(path: &Path) -> crate::Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_optional(path: &Path) -> crate::Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl StorageBackend for FlatFileBackend {
    fn name(&self) -> &str {
        "flat-file"
    }

    fn put_record(&self, kind: RecordKind, key: &str, data: &[u8]) -> crate::Result<()> {
        let path = self.record_path(kind, key)?;
        Self::atomic_write(&path, data)
    }

    fn get_record(&self, kind: RecordKind, key: &str) -> crate::Result<Option<Vec<u8>>> {
        Self::read_optional(&self.record_path(kind, key)?)
    }

    fn delete_record(&self, kind: RecordKind, key: &str) -> crate::Result<bool> {
        Self::remove_optional(&self.record_path(kind, key)?)
    }

    fn list_records(&self, kind: RecordKind) -> crate::Result<Vec<(String, Vec<u8>)>> {
        let dir = self.record_dir(kind);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry?;
            let key = entry.file_name().to_string_lossy().to_string();
            if key.starts_with(TMP_PREFIX) || !entry.file_type()?.is_file() {
                continue;
            }
            // A record deleted between read_dir and read is simply skipped.
            if let Some(data) = Self::read_optional(&entry.path())? {
                records.push((key, data));
            }
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }

    fn put_blob(&self, key: &BlobKey, data: &[u8]) -> crate::Result<()> {
        let path = self.blob_path(key)?;
        Self::atomic_write(&path, data)
    }

    fn get_blob(&self, key: &BlobKey) -> crate::Result<Option<Vec<u8>>> {
        Self::read_optional(&self.blob_path(key)?)
    }

    fn blob_exists(&self, key: &BlobKey) -> crate::Result<bool> {
        Ok(self.blob_path(key)?.is_file())
    }

    fn delete_blob(&self, key: &BlobKey) -> crate::Result<bool> {
        Self::remove_optional(&self.blob_path(key)?)
    }

    fn copy_blob(&self, from: &BlobKey, to: &BlobKey) -> crate::Result<u64> {
        let source = self.blob_path(from)?;
        let dest = self.blob_path(to)?;
        let parent = dest
            .parent()
            .ok_or_else(|| BuildWorldError::Storage(format!("invalid path {}", dest.display())))?;
        fs::create_dir_all(parent)?;

        let suffix: u64 = thread_rng().gen();
        let tmp = parent.join(format!("{TMP_PREFIX}.{suffix}.tmp"));
        let copied = fs::copy(&source, &tmp).and_then(|n| fs::rename(&tmp, &dest).map(|_| n));
        match copied {
            Ok(n) => Ok(n),
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Err(e.into())
            }
        }
    }

    fn rename_blob(&self, from: &BlobKey, to: &BlobKey) -> crate::Result<()> {
        let source = self.blob_path(from)?;
        let dest = self.blob_path(to)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&source, &dest)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[test]
    fn test_record_roundtrip_and_listing() {
        let tmp_dir = TempDir::new().unwrap();
        let backend = FlatFileBackend::new(tmp_dir.path()).unwrap();

        backend.put_record(RecordKind::Workspace, "beta", b"two").unwrap();
        backend.put_record(RecordKind::Workspace, "alpha", b"one").unwrap();
        backend.put_record(RecordKind::Workspace, "alpha", b"uno").unwrap();

        let records = backend.list_records(RecordKind::Workspace).unwrap();
        assert_eq!(
            records,
            vec![("alpha".to_string(), b"uno".to_vec()), ("beta".to_string(), b"two".to_vec())]
        );
        assert!(backend.list_records(RecordKind::Backup).unwrap().is_empty());

        assert!(backend.delete_record(RecordKind::Workspace, "alpha").unwrap());
        assert!(!backend.delete_record(RecordKind::Workspace, "alpha").unwrap());
        assert!(backend.get_record(RecordKind::Workspace, "alpha").unwrap().is_none());
    }

    #[test]
    fn test_record_key_with_separator_rejected() {
        let tmp_dir = TempDir::new().unwrap();
        let backend = FlatFileBackend::new(tmp_dir.path()).unwrap();
        assert!(backend.put_record(RecordKind::Workspace, "a/b", b"x").is_err());
    }

    #[test]
    fn test_blob_copy_and_rename() {
        let tmp_dir = TempDir::new().unwrap();
        let backend = FlatFileBackend::new(tmp_dir.path()).unwrap();
        let id = Uuid::new_v4();
        let content = BlobKey::content(id);
        let artifact = BlobKey::backup(&format!("{id}-1"));

        backend.put_blob(&content, b"voxels").unwrap();
        assert_eq!(backend.copy_blob(&content, &artifact).unwrap(), 6);
        backend.put_blob(&content, b"changed").unwrap();

        let staging = BlobKey::staging(id);
        backend.copy_blob(&artifact, &staging).unwrap();
        backend.rename_blob(&staging, &content).unwrap();

        assert_eq!(backend.get_blob(&content).unwrap().unwrap(), b"voxels");
        assert!(!backend.blob_exists(&staging).unwrap());
        assert!(backend.delete_blob(&artifact).unwrap());
        assert!(!backend.delete_blob(&artifact).unwrap());
    }

    #[test]
    fn test_copy_missing_blob_leaves_no_temp_files() {
        let tmp_dir = TempDir::new().unwrap();
        let backend = FlatFileBackend::new(tmp_dir.path()).unwrap();
        let id = Uuid::new_v4();
        backend.put_blob(&BlobKey::backup("placeholder"), b"").unwrap();

        assert!(backend
            .copy_blob(&BlobKey::content(id), &BlobKey::backup("target"))
            .is_err());
        let leftovers: Vec<_> = fs::read_dir(tmp_dir.path().join("blobs/backups"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }
}
