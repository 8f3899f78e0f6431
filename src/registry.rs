use crate::storage::{RecordCodec, RecordKind, StorageBackend};
use crate::workspace::{validate_name, VisibilityFilter, Workspace};
use crate::BuildWorldError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifies a workspace by name (case-insensitive) or by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceKey {
    Name(String),
    Id(Uuid),
}

impl From<&str> for WorkspaceKey {
    fn from(name: &str) -> Self {
        WorkspaceKey::Name(name.to_string())
    }
}

impl From<String> for WorkspaceKey {
    fn from(name: String) -> Self {
        WorkspaceKey::Name(name)
    }
}

impl From<Uuid> for WorkspaceKey {
    fn from(id: Uuid) -> Self {
        WorkspaceKey::Id(id)
    }
}

struct WorkspaceEntry {
    state: Mutex<Workspace>,
    // Serializes record writes for this workspace only.
    persist_lock: Mutex<()>,
    removed: AtomicBool,
    // Name the record is currently stored under, if any.
    persisted_name: Mutex<Option<String>>,
}

impl WorkspaceEntry {
    fn new(workspace: Workspace, persisted_name: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(workspace),
            persist_lock: Mutex::new(()),
            removed: AtomicBool::new(false),
            persisted_name: Mutex::new(persisted_name),
        })
    }
}

#[derive(Default)]
struct Index {
    by_id: HashMap<Uuid, Arc<WorkspaceEntry>>,
    by_name: HashMap<String, Uuid>,
}

/// A workspace taken out of the registry, with the name its record was last
/// written under.
#[derive(Debug, Clone)]
pub struct RemovedWorkspace {
    pub workspace: Workspace,
    stored_as: Option<String>,
}

/// Point-in-time copy of the registry contents.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceSnapshot {
    workspaces: Vec<Workspace>,
}

impl WorkspaceSnapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, Workspace> {
        self.workspaces.iter()
    }

    pub fn len(&self) -> usize {
        self.workspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty()
    }
}

impl IntoIterator for WorkspaceSnapshot {
    type Item = Workspace;
    type IntoIter = std::vec::IntoIter<Workspace>;

    fn into_iter(self) -> Self::IntoIter {
        self.workspaces.into_iter()
    }
}

impl<'a> IntoIterator for &'a WorkspaceSnapshot {
    type Item = &'a Workspace;
    type IntoIter = std::slice::Iter<'a, Workspace>;

    fn into_iter(self) -> Self::IntoIter {
        self.workspaces.iter()
    }
}

/// Canonical in-memory set of workspaces, written through to a backend.
///
/// The index lock is only held to find an entry; each workspace has its own
/// mutex, so mutations on different workspaces never wait on each other.
pub struct WorkspaceRegistry {
    index: RwLock<Index>,
    backend: Arc<dyn StorageBackend>,
    codec: RecordCodec,
}

fn lock<T>(mutex: &Mutex<T>) -> crate::Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|e| BuildWorldError::Storage(e.to_string()))
}

fn persist_entry(backend: &dyn StorageBackend, codec: RecordCodec, entry: &WorkspaceEntry) -> crate::Result<()> {
    let _guard = lock(&entry.persist_lock)?;
    if entry.removed.load(Ordering::SeqCst) {
        return Ok(());
    }
    // Always write the latest state, so out-of-order writers converge.
    let workspace = lock(&entry.state)?.clone();
    let bytes = codec.encode(&workspace)?;
    backend.put_record(RecordKind::Workspace, &workspace.name, &bytes)?;

    let mut persisted = lock(&entry.persisted_name)?;
    if let Some(old) = persisted.replace(workspace.name.clone()) {
        if old != workspace.name {
            backend.delete_record(RecordKind::Workspace, &old)?;
        }
    }
    Ok(())
}

impl WorkspaceRegistry {
    pub fn new(backend: Arc<dyn StorageBackend>, codec: RecordCodec) -> Self {
        Self {
            index: RwLock::new(Index::default()),
            backend,
            codec,
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn codec(&self) -> RecordCodec {
        self.codec
    }

    fn read_index(&self) -> crate::Result<std::sync::RwLockReadGuard<'_, Index>> {
        self.index.read().map_err(|e| BuildWorldError::Storage(e.to_string()))
    }

    fn write_index(&self) -> crate::Result<std::sync::RwLockWriteGuard<'_, Index>> {
        self.index.write().map_err(|e| BuildWorldError::Storage(e.to_string()))
    }

    /// Populates the registry from stored records, skipping malformed ones.
    pub fn load(&self) -> crate::Result<usize> {
        let records = self.backend.list_records(RecordKind::Workspace)?;
        let mut loaded = 0;
        let mut index = self.write_index()?;

        for (key, bytes) in records {
            let workspace: Workspace = match self.codec.decode(&bytes) {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(record = %key, error = %e, "skipping malformed workspace record");
                    continue;
                }
            };
            let name_key = workspace.name_key();
            if index.by_name.contains_key(&name_key) || index.by_id.contains_key(&workspace.id) {
                warn!(record = %key, workspace_id = %workspace.id, "skipping duplicate workspace record");
                continue;
            }
            index.by_name.insert(name_key, workspace.id);
            index.by_id.insert(workspace.id, WorkspaceEntry::new(workspace, Some(key)));
            loaded += 1;
        }

        info!(count = loaded, "loaded workspaces from storage");
        Ok(loaded)
    }

    pub fn register(&self, workspace: Workspace) -> crate::Result<()> {
        let entry = {
            let mut index = self.write_index()?;
            let name_key = workspace.name_key();
            if let Some(existing) = index.by_name.get(&name_key) {
                if *existing != workspace.id {
                    return Err(BuildWorldError::DuplicateName(workspace.name.clone()));
                }
            }

            let previous = index.by_id.get(&workspace.id).cloned();
            let persisted_name = match &previous {
                Some(old) => {
                    let old_state = lock(&old.state)?;
                    index.by_name.remove(&old_state.name_key());
                    old.removed.store(true, Ordering::SeqCst);
                    lock(&old.persisted_name)?.clone()
                }
                None => None,
            };

            debug!(workspace_id = %workspace.id, name = %workspace.name, "registering workspace");
            index.by_name.insert(name_key, workspace.id);
            let entry = WorkspaceEntry::new(workspace.clone(), persisted_name);
            index.by_id.insert(workspace.id, entry.clone());
            entry
        };
        self.schedule_persist(entry);
        Ok(())
    }

    pub fn lookup(&self, key: impl Into<WorkspaceKey>) -> Option<Workspace> {
        match key.into() {
            WorkspaceKey::Name(name) => self.lookup_by_name(&name),
            WorkspaceKey::Id(id) => self.lookup_by_id(id),
        }
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Workspace> {
        let id = *self.read_index().ok()?.by_name.get(&name.to_lowercase())?;
        self.lookup_by_id(id)
    }

    pub fn lookup_by_id(&self, id: Uuid) -> Option<Workspace> {
        let entry = self.entry(id)?;
        let state = entry.state.lock().ok()?;
        Some(state.clone())
    }

    /// Like [`lookup_by_id`](Self::lookup_by_id), failing with `WorkspaceNotFound`.
    pub fn get(&self, id: Uuid) -> crate::Result<Workspace> {
        self.lookup_by_id(id)
            .ok_or_else(|| BuildWorldError::WorkspaceNotFound(id.to_string()))
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.read_index()
            .map(|index| index.by_name.contains_key(&name.to_lowercase()))
            .unwrap_or(false)
    }

    fn entry(&self, id: Uuid) -> Option<Arc<WorkspaceEntry>> {
        self.read_index().ok()?.by_id.get(&id).cloned()
    }

    /// Applies `f` under the workspace's own lock and schedules a write if
    /// anything changed. Identity is immutable here; use [`rename`](Self::rename).
    pub fn update<F, R>(&self, id: Uuid, f: F) -> crate::Result<R>
    where
        F: FnOnce(&mut Workspace) -> R,
    {
        let entry = self
            .entry(id)
            .ok_or_else(|| BuildWorldError::WorkspaceNotFound(id.to_string()))?;

        let (result, changed) = {
            let mut state = lock(&entry.state)?;
            let before = state.clone();
            let result = f(&mut state);
            if state.id != before.id || state.name != before.name {
                warn!(workspace_id = %id, "identity changes through update are ignored");
                state.id = before.id;
                state.name = before.name.clone();
            }
            (result, *state != before)
        };

        if changed {
            self.schedule_persist(entry);
        }
        Ok(result)
    }

    pub fn rename(&self, id: Uuid, new_name: &str) -> crate::Result<String> {
        validate_name(new_name)?;
        let (entry, old_name) = {
            let mut index = self.write_index()?;
            let entry = index
                .by_id
                .get(&id)
                .cloned()
                .ok_or_else(|| BuildWorldError::WorkspaceNotFound(id.to_string()))?;
            let new_key = new_name.to_lowercase();
            if let Some(existing) = index.by_name.get(&new_key) {
                if *existing != id {
                    return Err(BuildWorldError::DuplicateName(new_name.to_string()));
                }
            }

            let mut state = lock(&entry.state)?;
            let old_name = std::mem::replace(&mut state.name, new_name.to_string());
            index.by_name.remove(&old_name.to_lowercase());
            index.by_name.insert(new_key, id);
            drop(state);
            (entry, old_name)
        };

        info!(workspace_id = %id, old_name = %old_name, new_name, "workspace renamed");
        self.schedule_persist(entry);
        Ok(old_name)
    }

    /// Removes the workspace from the index. Storage is left untouched, but
    /// no further writes for it will be issued once this returns.
    pub fn remove(&self, id: Uuid) -> crate::Result<RemovedWorkspace> {
        let entry = {
            let mut index = self.write_index()?;
            let entry = index
                .by_id
                .remove(&id)
                .ok_or_else(|| BuildWorldError::WorkspaceNotFound(id.to_string()))?;
            let name_key = lock(&entry.state)?.name_key();
            index.by_name.remove(&name_key);
            entry
        };

        entry.removed.store(true, Ordering::SeqCst);
        // Wait out an in-flight write so it cannot land after the caller
        // deletes the record.
        drop(lock(&entry.persist_lock)?);
        let workspace = lock(&entry.state)?.clone();
        let stored_as = lock(&entry.persisted_name)?.clone();
        debug!(workspace_id = %id, name = %workspace.name, "workspace removed from registry");
        Ok(RemovedWorkspace { workspace, stored_as })
    }

    /// Deletes the stored record of a workspace already removed from the
    /// index, including one still stored under a name it was renamed from.
    pub fn delete_record(&self, removed: &RemovedWorkspace) -> crate::Result<bool> {
        let mut deleted = self.backend.delete_record(RecordKind::Workspace, &removed.workspace.name)?;
        if let Some(stale) = removed.stored_as.as_deref() {
            if stale != removed.workspace.name {
                deleted |= self.backend.delete_record(RecordKind::Workspace, stale)?;
            }
        }
        Ok(deleted)
    }

    pub fn all(&self) -> WorkspaceSnapshot {
        let entries: Vec<Arc<WorkspaceEntry>> = match self.read_index() {
            Ok(index) => index.by_id.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        let mut workspaces: Vec<Workspace> = entries
            .iter()
            .filter_map(|entry| entry.state.lock().ok().map(|ws| ws.clone()))
            .collect();
        workspaces.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        WorkspaceSnapshot { workspaces }
    }

    pub fn created_by(&self, creator_id: Uuid, visibility: VisibilityFilter) -> Vec<Workspace> {
        self.all()
            .into_iter()
            .filter(|ws| ws.is_creator(creator_id) && ws.matches_visibility(visibility))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read_index().map(|index| index.by_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Synchronously writes every workspace record.
    pub fn flush(&self) -> crate::Result<()> {
        let entries: Vec<Arc<WorkspaceEntry>> = self.read_index()?.by_id.values().cloned().collect();
        for entry in entries {
            persist_entry(self.backend.as_ref(), self.codec, &entry)?;
        }
        Ok(())
    }

    fn schedule_persist(&self, entry: Arc<WorkspaceEntry>) {
        let backend = self.backend.clone();
        let codec = self.codec;
        let write = move || {
            if let Err(e) = persist_entry(backend.as_ref(), codec, &entry) {
                let id = entry.state.lock().map(|ws| ws.id.to_string()).unwrap_or_default();
                warn!(workspace_id = %id, operation = "persist", error = %e, "failed to write workspace record");
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }
}
