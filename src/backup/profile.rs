use super::{Backup, BackupStorage};
use crate::events::{BackupEvent, BackupOperation, BackupOutcome, EventDispatcher, EventKind};
use crate::registry::WorkspaceRegistry;
use crate::BuildWorldError;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};
use uuid::Uuid;

const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Runs a blocking storage call, retrying once after a short backoff when
/// the failure looks transient.
async fn blocking_with_retry<T, F>(
    storage: &Arc<BackupStorage>,
    workspace_id: Uuid,
    operation: &'static str,
    f: F,
) -> crate::Result<T>
where
    T: Send + 'static,
    F: Fn(&BackupStorage) -> crate::Result<T> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let attempt = || {
        let storage = storage.clone();
        let f = f.clone();
        tokio::task::spawn_blocking(move || f(&storage))
    };

    let result = match attempt().await? {
        Err(e) if e.is_transient() => {
            warn!(workspace_id = %workspace_id, operation, error = %e, "transient backup storage failure, retrying");
            tokio::time::sleep(RETRY_BACKOFF).await;
            attempt().await?
        }
        other => other,
    };
    result.map_err(|e| BuildWorldError::backup_io(workspace_id, operation, e))
}

/// Async backup operations for a single workspace.
///
/// Create, restore and delete are serialized per workspace through a lock
/// shared by every profile of that workspace. Creates and deletes wait for
/// the lock; a restore fails fast with `RestoreConflict` instead. Once an
/// operation holds the lock it runs on its own task, so dropping the returned
/// future only cancels work that has not started yet.
#[derive(Clone)]
pub struct BackupProfile {
    workspace_id: Uuid,
    storage: Arc<BackupStorage>,
    pub(super) gate: Arc<Mutex<()>>,
    max_backups: usize,
    dispatcher: Arc<EventDispatcher>,
    registry: Option<Arc<WorkspaceRegistry>>,
}

impl BackupProfile {
    pub(crate) fn new(
        workspace_id: Uuid,
        storage: Arc<BackupStorage>,
        gate: Arc<Mutex<()>>,
        max_backups: usize,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            workspace_id,
            storage,
            gate,
            max_backups: max_backups.max(1),
            dispatcher,
            registry: None,
        }
    }

    /// Refuse creates and restores once the workspace is no longer in `registry`.
    pub(crate) fn with_registry(mut self, registry: Option<Arc<WorkspaceRegistry>>) -> Self {
        self.registry = registry;
        self
    }

    fn ensure_registered(&self) -> crate::Result<()> {
        match &self.registry {
            Some(registry) if registry.lookup_by_id(self.workspace_id).is_none() => {
                Err(BuildWorldError::WorkspaceNotFound(self.workspace_id.to_string()))
            }
            _ => Ok(()),
        }
    }

    pub fn workspace_id(&self) -> Uuid {
        self.workspace_id
    }

    pub fn max_backups(&self) -> usize {
        self.max_backups
    }

    /// Backups currently recorded, newest first.
    pub async fn list_backups(&self) -> crate::Result<Vec<Backup>> {
        let id = self.workspace_id;
        blocking_with_retry(&self.storage, id, "list", move |s| s.list_backups(id)).await
    }

    pub async fn create_backup(&self) -> crate::Result<Backup> {
        let guard = self.gate.clone().lock_owned().await;
        let this = self.clone();
        tokio::spawn(async move { this.create_locked(guard).await }).await?
    }

    async fn create_locked(&self, _guard: OwnedMutexGuard<()>) -> crate::Result<Backup> {
        let id = self.workspace_id;
        let result = match self.ensure_registered() {
            Ok(()) => self.store_and_evict().await,
            Err(e) => Err(e),
        };
        match &result {
            Ok(backup) => {
                info!(workspace_id = %id, backup = %backup.key, "backup created");
                self.emit(Some(backup.key.clone()), BackupOperation::Create, BackupOutcome::Succeeded);
            }
            Err(e) => {
                error!(workspace_id = %id, operation = "create", error = %e, "{}", e.user_message("create"));
                self.emit(
                    None,
                    BackupOperation::Create,
                    BackupOutcome::Failed { error: e.to_string() },
                );
            }
        }
        result
    }

    async fn store_and_evict(&self) -> crate::Result<Backup> {
        let id = self.workspace_id;
        let existing = self.list_backups().await?;

        // Keys must stay unique even when two backups land in the same millisecond.
        let now = Utc::now().timestamp_millis();
        let created_at = existing.first().map_or(now, |newest| now.max(newest.created_at + 1));
        let backup =
            blocking_with_retry(&self.storage, id, "create", move |s| s.store_backup(id, created_at)).await?;

        // The backup is committed from here on; retention problems are logged,
        // never reported as a failed create.
        match self.list_backups().await {
            Ok(backups) => self.enforce_retention(backups).await,
            Err(e) => {
                warn!(workspace_id = %id, backup = %backup.key, error = %e, "could not list backups for eviction");
            }
        }
        Ok(backup)
    }

    /// Evicts oldest backups until the limit holds. After a normal create
    /// that is exactly one; more only when an earlier eviction was skipped.
    async fn enforce_retention(&self, mut backups: Vec<Backup>) {
        let mut count = backups.len();
        while count > self.max_backups {
            let Some(oldest) = backups.pop() else { break };
            if !self.evict(oldest).await {
                break;
            }
            count -= 1;
        }
        if let Err(e) = self.check_retention(count) {
            error!(workspace_id = %self.workspace_id, error = %e, "backup retention invariant broken, please report this");
        }
    }

    async fn evict(&self, oldest: Backup) -> bool {
        let key = oldest.key.clone();
        let id = self.workspace_id;
        match blocking_with_retry(&self.storage, id, "evict", move |s| s.delete_backup(&oldest)).await {
            Ok(_) => {
                info!(workspace_id = %id, backup = %key, "evicted oldest backup");
                self.emit(Some(key), BackupOperation::Evict, BackupOutcome::Succeeded);
                true
            }
            Err(e) => {
                warn!(workspace_id = %id, backup = %key, error = %e, "failed to evict oldest backup");
                self.emit(Some(key), BackupOperation::Evict, BackupOutcome::Failed { error: e.to_string() });
                false
            }
        }
    }

    /// Errors when more backups are recorded than the retention limit allows.
    pub fn check_retention(&self, count: usize) -> crate::Result<()> {
        if count > self.max_backups {
            return Err(BuildWorldError::RetentionViolation {
                workspace_id: self.workspace_id,
                count,
                max: self.max_backups,
            });
        }
        Ok(())
    }

    /// Restores the workspace content from `backup`.
    ///
    /// Rejected immediately with `RestoreConflict` while another backup
    /// operation on this workspace is in flight.
    pub async fn restore_backup(&self, backup: &Backup, actor: Option<&str>) -> crate::Result<()> {
        let id = self.workspace_id;
        if backup.workspace_id != id {
            return Err(BuildWorldError::BackupNotFound(backup.key.clone()));
        }

        let guard = match self.gate.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                let err = BuildWorldError::RestoreConflict(id);
                warn!(workspace_id = %id, backup = %backup.key, error = %err, "restore rejected");
                self.emit(
                    Some(backup.key.clone()),
                    BackupOperation::Restore,
                    BackupOutcome::Rejected { error: err.to_string() },
                );
                return Err(err);
            }
        };

        if let Err(err) = self.ensure_registered() {
            warn!(workspace_id = %id, backup = %backup.key, error = %err, "restore rejected");
            self.emit(
                Some(backup.key.clone()),
                BackupOperation::Restore,
                BackupOutcome::Rejected { error: err.to_string() },
            );
            return Err(err);
        }

        let this = self.clone();
        let backup = backup.clone();
        let actor = actor.map(str::to_string);
        tokio::spawn(async move {
            let _guard = guard;
            let key = backup.key.clone();
            let result =
                blocking_with_retry(&this.storage, id, "restore", move |s| s.restore_backup(&backup)).await;
            match &result {
                Ok(()) => {
                    info!(workspace_id = %id, backup = %key, actor = actor.as_deref().unwrap_or("-"), "backup restored");
                    this.emit(Some(key), BackupOperation::Restore, BackupOutcome::Succeeded);
                }
                Err(e) => {
                    error!(workspace_id = %id, backup = %key, operation = "restore", error = %e, "{}", e.user_message("restore"));
                    this.emit(Some(key), BackupOperation::Restore, BackupOutcome::Failed { error: e.to_string() });
                }
            }
            result
        })
        .await?
    }

    /// Deletes a backup. Deleting one that is already gone is not an error.
    pub async fn delete_backup(&self, backup: &Backup) -> crate::Result<bool> {
        let guard = self.gate.clone().lock_owned().await;
        let this = self.clone();
        let backup = backup.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let id = this.workspace_id;
            let key = backup.key.clone();
            let result = blocking_with_retry(&this.storage, id, "delete", move |s| s.delete_backup(&backup)).await;
            match &result {
                Ok(_) => this.emit(Some(key), BackupOperation::Delete, BackupOutcome::Succeeded),
                Err(e) => {
                    error!(workspace_id = %id, backup = %key, operation = "delete", error = %e, "failed to delete backup");
                    this.emit(Some(key), BackupOperation::Delete, BackupOutcome::Failed { error: e.to_string() });
                }
            }
            result
        })
        .await?
    }

    /// Deletes every backup of the workspace.
    pub async fn destroy(&self) -> crate::Result<usize> {
        let guard = self.gate.clone().lock_owned().await;
        let this = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let id = this.workspace_id;
            let result = blocking_with_retry(&this.storage, id, "purge", move |s| s.purge_workspace(id)).await;
            match &result {
                Ok(count) => {
                    info!(workspace_id = %id, count, "purged backups");
                    this.emit(None, BackupOperation::Delete, BackupOutcome::Succeeded);
                }
                Err(e) => {
                    error!(workspace_id = %id, operation = "purge", error = %e, "failed to purge backups");
                    this.emit(None, BackupOperation::Delete, BackupOutcome::Failed { error: e.to_string() });
                }
            }
            result
        })
        .await?
    }

    fn emit(&self, backup_key: Option<String>, operation: BackupOperation, outcome: BackupOutcome) {
        self.dispatcher.publish(EventKind::Backup(BackupEvent {
            workspace_id: self.workspace_id,
            backup_key,
            operation,
            outcome,
        }));
    }
}
