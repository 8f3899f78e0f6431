use super::{validate_key, BlobKey, RecordKind, StorageBackend};
use crate::BuildWorldError;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct MemoryInner {
    records: HashMap<(RecordKind, String), Vec<u8>>,
    blobs: HashMap<String, Vec<u8>>,
}

/// Backend that keeps everything in process memory. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob_count(&self, prefix: &str) -> usize {
        self.with_read(|guard| guard.blobs.keys().filter(|k| k.starts_with(prefix)).count())
            .unwrap_or(0)
    }

    fn with_read<F, R>(&self, f: F) -> crate::Result<R>
    where
        F: FnOnce(&MemoryInner) -> R,
    {
        let guard = self.inner.read().map_err(|e| BuildWorldError::Storage(e.to_string()))?;
        Ok(f(&guard))
    }

    fn with_write<F, R>(&self, f: F) -> crate::Result<R>
    where
        F: FnOnce(&mut MemoryInner) -> R,
    {
        let mut guard = self.inner.write().map_err(|e| BuildWorldError::Storage(e.to_string()))?;
        Ok(f(&mut guard))
    }
}

fn missing(key: &BlobKey) -> BuildWorldError {
    BuildWorldError::FileSystem(io::Error::new(io::ErrorKind::NotFound, format!("blob {key} not found")))
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn put_record(&self, kind: RecordKind, key: &str, data: &[u8]) -> crate::Result<()> {
        validate_key(key)?;
        self.with_write(|guard| {
            guard.records.insert((kind, key.to_string()), data.to_vec());
        })
    }

    fn get_record(&self, kind: RecordKind, key: &str) -> crate::Result<Option<Vec<u8>>> {
        self.with_read(|guard| guard.records.get(&(kind, key.to_string())).cloned())
    }

    fn delete_record(&self, kind: RecordKind, key: &str) -> crate::Result<bool> {
        self.with_write(|guard| guard.records.remove(&(kind, key.to_string())).is_some())
    }

    fn list_records(&self, kind: RecordKind) -> crate::Result<Vec<(String, Vec<u8>)>> {
        self.with_read(|guard| {
            let mut records: Vec<(String, Vec<u8>)> = guard
                .records
                .iter()
                .filter(|((k, _), _)| *k == kind)
                .map(|((_, key), data)| (key.clone(), data.clone()))
                .collect();
            records.sort_by(|a, b| a.0.cmp(&b.0));
            records
        })
    }

    fn put_blob(&self, key: &BlobKey, data: &[u8]) -> crate::Result<()> {
        validate_key(key.as_str())?;
        self.with_write(|guard| {
            guard.blobs.insert(key.as_str().to_string(), data.to_vec());
        })
    }

    fn get_blob(&self, key: &BlobKey) -> crate::Result<Option<Vec<u8>>> {
        self.with_read(|guard| guard.blobs.get(key.as_str()).cloned())
    }

    fn blob_exists(&self, key: &BlobKey) -> crate::Result<bool> {
        self.with_read(|guard| guard.blobs.contains_key(key.as_str()))
    }

    fn delete_blob(&self, key: &BlobKey) -> crate::Result<bool> {
        self.with_write(|guard| guard.blobs.remove(key.as_str()).is_some())
    }

    fn copy_blob(&self, from: &BlobKey, to: &BlobKey) -> crate::Result<u64> {
        validate_key(to.as_str())?;
        self.with_write(|guard| {
            let data = guard.blobs.get(from.as_str()).cloned().ok_or_else(|| missing(from))?;
            let len = data.len() as u64;
            guard.blobs.insert(to.as_str().to_string(), data);
            Ok(len)
        })?
    }

    fn rename_blob(&self, from: &BlobKey, to: &BlobKey) -> crate::Result<()> {
        validate_key(to.as_str())?;
        self.with_write(|guard| {
            let data = guard.blobs.remove(from.as_str()).ok_or_else(|| missing(from))?;
            guard.blobs.insert(to.as_str().to_string(), data);
            Ok(())
        })?
    }
}
