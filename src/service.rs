use crate::backup::{AutoBackupScheduler, BackupService, BackupStorage};
use crate::config::BuildWorldConfig;
use crate::events::{EventDispatcher, EventKind, RegistryEvent};
use crate::lifecycle::LifecycleController;
use crate::registry::{WorkspaceKey, WorkspaceRegistry};
use crate::storage::{BackendRegistry, BlobKey, RecordCodec, StorageBackend};
use crate::workspace::{validate_name, Builder, DisplayMetadata, Visibility, Workspace, WorldType};
use crate::BuildWorldError;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Entry point for hosts: owns the registry, lifecycle controller, backup
/// service and event dispatcher, all of which are injected.
pub struct WorkspaceService {
    config: BuildWorldConfig,
    registry: Arc<WorkspaceRegistry>,
    lifecycle: Arc<LifecycleController>,
    backups: Arc<BackupService>,
    dispatcher: Arc<EventDispatcher>,
}

impl WorkspaceService {
    pub fn new(
        config: BuildWorldConfig,
        registry: Arc<WorkspaceRegistry>,
        lifecycle: Arc<LifecycleController>,
        backups: Arc<BackupService>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            config,
            registry,
            lifecycle,
            backups,
            dispatcher,
        }
    }

    /// Resolves the configured backend from the built-in ones and loads every
    /// stored workspace.
    pub fn open(config: BuildWorldConfig) -> crate::Result<Self> {
        Self::open_with(config, &BackendRegistry::with_builtin())
    }

    /// Like [`open`](Self::open), with a caller-supplied set of backends.
    pub fn open_with(config: BuildWorldConfig, backends: &BackendRegistry) -> crate::Result<Self> {
        config.validate()?;
        let backend = backends.resolve(&config.storage)?;
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: BuildWorldConfig, backend: Arc<dyn StorageBackend>) -> crate::Result<Self> {
        let codec = RecordCodec::new(config.storage.record_format);
        let dispatcher = Arc::new(EventDispatcher::new(config.events.channel_capacity));

        let registry = Arc::new(WorkspaceRegistry::new(backend.clone(), codec));
        let loaded = registry.load()?;
        let lifecycle = Arc::new(LifecycleController::new(registry.clone(), dispatcher.clone()));
        let backups = Arc::new(BackupService::new(
            Arc::new(BackupStorage::new(backend.clone(), codec)),
            dispatcher.clone(),
            config.backup.max_backups_per_workspace,
        )
        .with_registry(registry.clone()));

        info!(
            backend = backend.name(),
            workspaces = loaded,
            max_backups = config.backup.max_backups_per_workspace,
            "workspace service ready"
        );
        Ok(Self::new(config, registry, lifecycle, backups, dispatcher))
    }

    pub fn config(&self) -> &BuildWorldConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<WorkspaceRegistry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleController> {
        &self.lifecycle
    }

    pub fn backups(&self) -> &Arc<BackupService> {
        &self.backups
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Resolves a workspace by case-insensitive name or by id.
    pub fn workspace(&self, key: impl Into<WorkspaceKey>) -> crate::Result<Workspace> {
        let key = key.into();
        self.registry.lookup(key.clone()).ok_or_else(|| {
            BuildWorldError::WorkspaceNotFound(match key {
                WorkspaceKey::Name(name) => name,
                WorkspaceKey::Id(id) => id.to_string(),
            })
        })
    }

    pub fn create_workspace(
        &self,
        name: &str,
        creator: Option<Builder>,
        world_type: WorldType,
        visibility: Visibility,
    ) -> crate::Result<Workspace> {
        validate_name(name)?;
        self.register(Workspace::new(name, creator, world_type, visibility))
    }

    /// Registers existing world data that has no creator.
    pub fn import_workspace(&self, name: &str, world_type: WorldType) -> crate::Result<Workspace> {
        validate_name(name)?;
        self.register(Workspace::imported(name, world_type))
    }

    fn register(&self, workspace: Workspace) -> crate::Result<Workspace> {
        let registered = if self.registry.contains_name(&workspace.name) {
            Err(BuildWorldError::DuplicateName(workspace.name.clone()))
        } else {
            self.registry.register(workspace.clone())
        };
        if let Err(e) = registered {
            warn!(workspace_id = %workspace.id, operation = "create", error = %e, "workspace not created");
            return Err(e);
        }
        info!(workspace_id = %workspace.id, name = %workspace.name, world_type = ?workspace.world_type, "workspace created");
        self.dispatcher.publish(EventKind::Registry(RegistryEvent::Created {
            workspace_id: workspace.id,
            name: workspace.name.clone(),
        }));
        Ok(workspace)
    }

    /// Removes a workspace with its record and content. Its backups are
    /// purged unless `retain_orphans` (or the configured default) keeps them.
    /// Returns the number of backups purged.
    pub async fn delete_workspace(&self, id: Uuid, retain_orphans: Option<bool>) -> crate::Result<usize> {
        let removed = self.registry.remove(id)?;
        let workspace = removed.workspace.clone();
        let retain = retain_orphans.unwrap_or(self.config.backup.retain_orphaned_backups);

        let backend = self.registry.backend().clone();
        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || -> crate::Result<()> {
            registry.delete_record(&removed)?;
            backend.delete_blob(&BlobKey::content(removed.workspace.id))?;
            Ok(())
        })
        .await?
        .map_err(|e| {
            error!(workspace_id = %id, operation = "delete", error = %e, "failed to delete workspace data");
            e
        })?;

        let purged = if retain {
            0
        } else {
            self.backups.purge_workspace(id).await?
        };

        info!(workspace_id = %id, name = %workspace.name, backups_purged = purged, retained = retain, "workspace deleted");
        self.dispatcher.publish(EventKind::Registry(RegistryEvent::Deleted {
            workspace_id: id,
            name: workspace.name,
            backups_purged: purged,
        }));
        Ok(purged)
    }

    pub fn rename_workspace(&self, id: Uuid, new_name: &str) -> crate::Result<String> {
        let old_name = self.registry.rename(id, new_name).map_err(|e| {
            warn!(workspace_id = %id, operation = "rename", error = %e, "rename failed");
            e
        })?;
        if old_name != new_name {
            self.dispatcher.publish(EventKind::Registry(RegistryEvent::Renamed {
                workspace_id: id,
                old_name: old_name.clone(),
                new_name: new_name.to_string(),
            }));
        }
        Ok(old_name)
    }

    /// Returns false if the builder was already present or is the creator.
    pub fn add_builder(&self, id: Uuid, builder: Builder) -> crate::Result<bool> {
        self.registry.update(id, |ws| ws.add_builder(builder))
    }

    pub fn remove_builder(&self, id: Uuid, builder_id: Uuid) -> crate::Result<bool> {
        self.registry.update(id, |ws| ws.remove_builder(builder_id))
    }

    pub fn set_visibility(&self, id: Uuid, visibility: Visibility) -> crate::Result<()> {
        self.registry.update(id, |ws| ws.visibility = visibility)
    }

    pub fn set_physics(&self, id: Uuid, physics: bool) -> crate::Result<()> {
        self.registry.update(id, |ws| ws.physics = physics)
    }

    pub fn set_display(&self, id: Uuid, display: DisplayMetadata) -> crate::Result<()> {
        self.registry.update(id, |ws| ws.display = display)
    }

    /// Replaces the stored content of a workspace.
    pub fn write_content(&self, id: Uuid, data: &[u8]) -> crate::Result<()> {
        self.registry.get(id)?;
        self.registry.backend().put_blob(&BlobKey::content(id), data)
    }

    pub fn read_content(&self, id: Uuid) -> crate::Result<Option<Vec<u8>>> {
        self.registry.get(id)?;
        self.registry.backend().get_blob(&BlobKey::content(id))
    }

    /// Starts the auto-backup timer when it is enabled in the config.
    pub fn start_auto_backup(&self) -> Option<JoinHandle<()>> {
        let auto = &self.config.backup.auto_backup;
        if !auto.enabled {
            return None;
        }
        let scheduler = AutoBackupScheduler::new(self.registry.clone(), self.backups.clone(), auto.clone());
        Some(scheduler.spawn())
    }

    /// Writes every workspace record synchronously.
    pub fn shutdown(&self) {
        if let Err(e) = self.registry.flush() {
            warn!(error = %e, "failed to flush workspace records on shutdown");
        }
    }
}
