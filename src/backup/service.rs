use super::{Backup, BackupProfile, BackupStorage};
use crate::events::EventDispatcher;
use crate::registry::WorkspaceRegistry;
use crate::BuildWorldError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

/// Hands out [`BackupProfile`]s.
///
/// Profiles are cheap and may be created freely; every profile for the same
/// workspace shares one operation lock from the table kept here. Locks are
/// never dropped from the table, so a profile held across a workspace
/// deletion still serializes with profiles handed out later.
///
/// With a registry attached, backups can only be created or restored for
/// registered workspaces. Listing and deleting stay open so retained backups
/// of deleted workspaces remain manageable.
pub struct BackupService {
    storage: Arc<BackupStorage>,
    dispatcher: Arc<EventDispatcher>,
    max_backups: usize,
    gates: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    registry: Option<Arc<WorkspaceRegistry>>,
}

impl BackupService {
    pub fn new(storage: Arc<BackupStorage>, dispatcher: Arc<EventDispatcher>, max_backups: usize) -> Self {
        Self {
            storage,
            dispatcher,
            max_backups: max_backups.max(1),
            gates: Mutex::new(HashMap::new()),
            registry: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<WorkspaceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    fn gate(&self, workspace_id: Uuid) -> crate::Result<Arc<tokio::sync::Mutex<()>>> {
        let mut gates = self
            .gates
            .lock()
            .map_err(|e| BuildWorldError::Storage(format!("Failed to acquire gate lock: {}", e)))?;
        Ok(gates
            .entry(workspace_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }

    pub fn profile(&self, workspace_id: Uuid) -> crate::Result<BackupProfile> {
        Ok(BackupProfile::new(
            workspace_id,
            self.storage.clone(),
            self.gate(workspace_id)?,
            self.max_backups,
            self.dispatcher.clone(),
        )
        .with_registry(self.registry.clone()))
    }

    /// Creates one backup of the workspace's current content.
    pub async fn backup(&self, workspace_id: Uuid) -> crate::Result<Backup> {
        self.profile(workspace_id)?.create_backup().await
    }

    /// Newest backup of a workspace, if any.
    pub async fn latest(&self, workspace_id: Uuid) -> crate::Result<Option<Backup>> {
        Ok(self.profile(workspace_id)?.list_backups().await?.into_iter().next())
    }

    /// Looks up a backup of `workspace_id` by its key.
    pub async fn find(&self, workspace_id: Uuid, key: &str) -> crate::Result<Backup> {
        self.profile(workspace_id)?
            .list_backups()
            .await?
            .into_iter()
            .find(|b| b.key == key)
            .ok_or_else(|| BuildWorldError::BackupNotFound(key.to_string()))
    }

    /// Deletes every backup of a workspace that is being removed.
    pub async fn purge_workspace(&self, workspace_id: Uuid) -> crate::Result<usize> {
        let removed = self.profile(workspace_id)?.destroy().await?;
        debug!(workspace_id = %workspace_id, removed, "backups purged for removed workspace");
        Ok(removed)
    }

    pub fn max_backups(&self) -> usize {
        self.max_backups
    }

    pub fn storage(&self) -> &Arc<BackupStorage> {
        &self.storage
    }
}
