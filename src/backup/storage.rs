use super::Backup;
use crate::storage::{BlobKey, RecordCodec, RecordKind, StorageBackend};
use crate::BuildWorldError;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

fn checksum(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Stores, lists and removes backup artifacts and their records.
///
/// Every method is blocking; [`BackupProfile`](super::BackupProfile) runs them
/// on the blocking pool.
pub struct BackupStorage {
    backend: Arc<dyn StorageBackend>,
    codec: RecordCodec,
}

impl BackupStorage {
    pub fn new(backend: Arc<dyn StorageBackend>, codec: RecordCodec) -> Self {
        Self { backend, codec }
    }

    /// Backups recorded for a workspace, newest first.
    pub fn list_backups(&self, workspace_id: Uuid) -> crate::Result<Vec<Backup>> {
        let prefix = format!("{workspace_id}-");
        let mut backups: Vec<Backup> = self
            .backend
            .list_records(RecordKind::Backup)?
            .into_iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, bytes)| match self.codec.decode::<Backup>(&bytes) {
                Ok(backup) if backup.workspace_id == workspace_id => Some(backup),
                Ok(_) => None,
                Err(e) => {
                    warn!(record = %key, error = %e, "skipping malformed backup record");
                    None
                }
            })
            .collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    /// Snapshots the workspace's stored content into a new artifact and
    /// records it. Nothing is left behind when either step fails.
    ///
    /// A workspace without stored content produces an empty artifact.
    pub fn store_backup(&self, workspace_id: Uuid, created_at: i64) -> crate::Result<Backup> {
        let key = Backup::key_for(workspace_id, created_at);
        let artifact = BlobKey::backup(&key);
        let content = self
            .backend
            .get_blob(&BlobKey::content(workspace_id))?
            .unwrap_or_default();

        self.backend.put_blob(&artifact, &content)?;
        let backup = Backup {
            workspace_id,
            created_at,
            key: key.clone(),
            size: content.len() as u64,
            checksum: checksum(&content),
        };

        let recorded = self
            .codec
            .encode(&backup)
            .and_then(|bytes| self.backend.put_record(RecordKind::Backup, &key, &bytes));
        if let Err(e) = recorded {
            if let Err(cleanup) = self.backend.delete_blob(&artifact) {
                warn!(backup = %key, error = %cleanup, "could not remove unrecorded backup artifact");
            }
            return Err(e);
        }

        debug!(workspace_id = %workspace_id, backup = %key, size = backup.size, "backup stored");
        Ok(backup)
    }

    /// Removes a backup's record and artifact. Returns false when neither existed.
    pub fn delete_backup(&self, backup: &Backup) -> crate::Result<bool> {
        // Record first: a listed backup must always have its artifact.
        let record = self.backend.delete_record(RecordKind::Backup, &backup.key)?;
        let artifact = self.backend.delete_blob(&BlobKey::backup(&backup.key))?;
        Ok(record || artifact)
    }

    /// Replaces the workspace content with the artifact's. The content is
    /// swapped in with a single rename after the staged copy is verified, so
    /// a failure leaves the previous content in place.
    pub fn restore_backup(&self, backup: &Backup) -> crate::Result<()> {
        let artifact = BlobKey::backup(&backup.key);
        if !self.backend.blob_exists(&artifact)? {
            return Err(BuildWorldError::BackupNotFound(backup.key.clone()));
        }

        let staging = BlobKey::staging(backup.workspace_id);
        let swapped = self.stage_and_swap(backup, &artifact, &staging);
        if swapped.is_err() {
            if let Err(cleanup) = self.backend.delete_blob(&staging) {
                warn!(backup = %backup.key, staging = %staging, error = %cleanup, "could not remove staged restore copy");
            }
        }
        swapped
    }

    fn stage_and_swap(&self, backup: &Backup, artifact: &BlobKey, staging: &BlobKey) -> crate::Result<()> {
        self.backend.copy_blob(artifact, staging)?;
        let staged = self
            .backend
            .get_blob(staging)?
            .ok_or_else(|| BuildWorldError::BackupNotFound(backup.key.clone()))?;
        if checksum(&staged) != backup.checksum {
            return Err(BuildWorldError::ChecksumMismatch {
                key: backup.key.clone(),
            });
        }
        self.backend
            .rename_blob(staging, &BlobKey::content(backup.workspace_id))
    }

    /// Deletes every backup of a workspace, returning how many were removed.
    pub fn purge_workspace(&self, workspace_id: Uuid) -> crate::Result<usize> {
        let mut removed = 0;
        for backup in self.list_backups(workspace_id)? {
            if self.delete_backup(&backup)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Delegates to a memory backend, failing selected operations on demand.
    #[derive(Default)]
    pub(crate) struct FlakyBackend {
        pub inner: MemoryBackend,
        pub fail_record_writes: AtomicUsize,
        pub fail_blob_writes: AtomicUsize,
        pub fail_renames: AtomicUsize,
        pub fail_blob_deletes: AtomicUsize,
        /// Every `list_records` call from this one on (1-based) fails; 0 disables.
        pub fail_lists_from: AtomicUsize,
        pub lists_seen: AtomicUsize,
        pub transient: std::sync::atomic::AtomicBool,
    }

    impl FlakyBackend {
        fn failure(&self) -> BuildWorldError {
            let kind = if self.transient.load(Ordering::SeqCst) {
                io::ErrorKind::TimedOut
            } else {
                io::ErrorKind::PermissionDenied
            };
            BuildWorldError::FileSystem(io::Error::new(kind, "injected failure"))
        }

        fn trip(&self, counter: &AtomicUsize) -> crate::Result<()> {
            let tripped = counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if tripped {
                return Err(self.failure());
            }
            Ok(())
        }
    }

    impl StorageBackend for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }
        fn put_record(&self, kind: RecordKind, key: &str, data: &[u8]) -> crate::Result<()> {
            self.trip(&self.fail_record_writes)?;
            self.inner.put_record(kind, key, data)
        }
        fn get_record(&self, kind: RecordKind, key: &str) -> crate::Result<Option<Vec<u8>>> {
            self.inner.get_record(kind, key)
        }
        fn delete_record(&self, kind: RecordKind, key: &str) -> crate::Result<bool> {
            self.inner.delete_record(kind, key)
        }
        fn list_records(&self, kind: RecordKind) -> crate::Result<Vec<(String, Vec<u8>)>> {
            let call = self.lists_seen.fetch_add(1, Ordering::SeqCst) + 1;
            let from = self.fail_lists_from.load(Ordering::SeqCst);
            if from != 0 && call >= from {
                return Err(self.failure());
            }
            self.inner.list_records(kind)
        }
        fn put_blob(&self, key: &BlobKey, data: &[u8]) -> crate::Result<()> {
            self.trip(&self.fail_blob_writes)?;
            self.inner.put_blob(key, data)
        }
        fn get_blob(&self, key: &BlobKey) -> crate::Result<Option<Vec<u8>>> {
            self.inner.get_blob(key)
        }
        fn blob_exists(&self, key: &BlobKey) -> crate::Result<bool> {
            self.inner.blob_exists(key)
        }
        fn delete_blob(&self, key: &BlobKey) -> crate::Result<bool> {
            self.trip(&self.fail_blob_deletes)?;
            self.inner.delete_blob(key)
        }
        fn copy_blob(&self, from: &BlobKey, to: &BlobKey) -> crate::Result<u64> {
            self.inner.copy_blob(from, to)
        }
        fn rename_blob(&self, from: &BlobKey, to: &BlobKey) -> crate::Result<()> {
            self.trip(&self.fail_renames)?;
            self.inner.rename_blob(from, to)
        }
    }

    fn storage_with(backend: Arc<dyn StorageBackend>) -> BackupStorage {
        BackupStorage::new(backend, RecordCodec::default())
    }

    #[test]
    fn test_store_and_list_newest_first() {
        let backend = MemoryBackend::new();
        let storage = storage_with(Arc::new(backend.clone()));
        let id = Uuid::new_v4();
        backend.put_blob(&BlobKey::content(id), b"v1").unwrap();

        storage.store_backup(id, 1_000).unwrap();
        storage.store_backup(id, 3_000).unwrap();
        storage.store_backup(id, 2_000).unwrap();
        storage.store_backup(Uuid::new_v4(), 4_000).unwrap();

        let listed: Vec<i64> = storage.list_backups(id).unwrap().iter().map(|b| b.created_at).collect();
        assert_eq!(listed, vec![3_000, 2_000, 1_000]);
    }

    #[test]
    fn test_failed_record_write_leaves_no_artifact() {
        let flaky = Arc::new(FlakyBackend::default());
        let storage = storage_with(flaky.clone());
        let id = Uuid::new_v4();
        flaky.fail_record_writes.store(1, Ordering::SeqCst);

        assert!(storage.store_backup(id, 1).is_err());
        assert!(storage.list_backups(id).unwrap().is_empty());
        assert_eq!(flaky.inner.blob_count("backups/"), 0);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let backend = MemoryBackend::new();
        let storage = storage_with(Arc::new(backend.clone()));
        let id = Uuid::new_v4();
        let backup = storage.store_backup(id, 10).unwrap();
        storage.store_backup(id, 20).unwrap();

        assert!(storage.delete_backup(&backup).unwrap());
        assert!(!storage.delete_backup(&backup).unwrap());
        assert_eq!(backend.blob_count("backups/"), 1);
        assert_eq!(storage.list_backups(id).unwrap().len(), 1);
    }

    #[test]
    fn test_restore_swaps_content() {
        let backend = MemoryBackend::new();
        let storage = storage_with(Arc::new(backend.clone()));
        let id = Uuid::new_v4();
        backend.put_blob(&BlobKey::content(id), b"original").unwrap();
        let backup = storage.store_backup(id, 1).unwrap();
        backend.put_blob(&BlobKey::content(id), b"griefed").unwrap();

        storage.restore_backup(&backup).unwrap();
        assert_eq!(backend.get_blob(&BlobKey::content(id)).unwrap().unwrap(), b"original");
        assert_eq!(backend.blob_count("staging/"), 0);
        // The artifact survives a restore.
        assert!(backend.blob_exists(&BlobKey::backup(&backup.key)).unwrap());
    }

    #[test]
    fn test_failed_restore_keeps_content() {
        let flaky = Arc::new(FlakyBackend::default());
        let storage = storage_with(flaky.clone());
        let id = Uuid::new_v4();
        flaky.inner.put_blob(&BlobKey::content(id), b"original").unwrap();
        let backup = storage.store_backup(id, 1).unwrap();
        flaky.inner.put_blob(&BlobKey::content(id), b"current").unwrap();

        flaky.fail_renames.store(1, Ordering::SeqCst);
        assert!(storage.restore_backup(&backup).is_err());
        assert_eq!(flaky.inner.get_blob(&BlobKey::content(id)).unwrap().unwrap(), b"current");
        assert_eq!(flaky.inner.blob_count("staging/"), 0);
    }

    #[test]
    fn test_failed_staging_cleanup_keeps_restore_error() {
        let flaky = Arc::new(FlakyBackend::default());
        let storage = storage_with(flaky.clone());
        let id = Uuid::new_v4();
        flaky.inner.put_blob(&BlobKey::content(id), b"original").unwrap();
        let backup = storage.store_backup(id, 1).unwrap();
        flaky.inner.put_blob(&BlobKey::content(id), b"current").unwrap();

        flaky.fail_renames.store(1, Ordering::SeqCst);
        flaky.fail_blob_deletes.store(1, Ordering::SeqCst);
        let err = storage.restore_backup(&backup).unwrap_err();
        assert!(matches!(err, BuildWorldError::FileSystem(_)));
        // Only the cleanup was skipped; content is untouched and the next
        // restore goes through.
        assert_eq!(flaky.inner.get_blob(&BlobKey::content(id)).unwrap().unwrap(), b"current");
        assert_eq!(flaky.fail_blob_deletes.load(Ordering::SeqCst), 0);
        storage.restore_backup(&backup).unwrap();
        assert_eq!(flaky.inner.get_blob(&BlobKey::content(id)).unwrap().unwrap(), b"original");
    }

    #[test]
    fn test_corrupted_artifact_is_not_restored() {
        let backend = MemoryBackend::new();
        let storage = storage_with(Arc::new(backend.clone()));
        let id = Uuid::new_v4();
        backend.put_blob(&BlobKey::content(id), b"original").unwrap();
        let backup = storage.store_backup(id, 1).unwrap();
        backend.put_blob(&BlobKey::backup(&backup.key), b"bitrot").unwrap();
        backend.put_blob(&BlobKey::content(id), b"current").unwrap();

        assert!(matches!(
            storage.restore_backup(&backup),
            Err(BuildWorldError::ChecksumMismatch { .. })
        ));
        assert_eq!(backend.get_blob(&BlobKey::content(id)).unwrap().unwrap(), b"current");
    }

    #[test]
    fn test_restore_of_missing_artifact() {
        let backend = MemoryBackend::new();
        let storage = storage_with(Arc::new(backend.clone()));
        let id = Uuid::new_v4();
        let backup = storage.store_backup(id, 1).unwrap();
        backend.delete_blob(&BlobKey::backup(&backup.key)).unwrap();
        assert!(matches!(storage.restore_backup(&backup), Err(BuildWorldError::BackupNotFound(_))));
    }

    #[test]
    fn test_purge_workspace() {
        let backend = MemoryBackend::new();
        let storage = storage_with(Arc::new(backend.clone()));
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();
        for ts in 1..=3 {
            storage.store_backup(id, ts).unwrap();
        }
        storage.store_backup(other, 1).unwrap();

        assert_eq!(storage.purge_workspace(id).unwrap(), 3);
        assert!(storage.list_backups(id).unwrap().is_empty());
        assert_eq!(storage.list_backups(other).unwrap().len(), 1);
        assert_eq!(backend.blob_count("backups/"), 1);
    }
}
