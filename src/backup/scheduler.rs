use super::BackupService;
use crate::config::AutoBackupConfig;
use crate::registry::WorkspaceRegistry;
use crate::workspace::{Workspace, WorkspaceStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutoBackupReport {
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Periodically backs up every registered workspace.
pub struct AutoBackupScheduler {
    registry: Arc<WorkspaceRegistry>,
    backups: Arc<BackupService>,
    config: AutoBackupConfig,
}

impl AutoBackupScheduler {
    pub fn new(registry: Arc<WorkspaceRegistry>, backups: Arc<BackupService>, config: AutoBackupConfig) -> Self {
        Self {
            registry,
            backups,
            config,
        }
    }

    async fn needs_backup(&self, workspace: &Workspace) -> crate::Result<bool> {
        if workspace.status == WorkspaceStatus::Archive {
            return Ok(false);
        }
        if !self.config.only_modified {
            return Ok(true);
        }
        let Some(last_edited) = workspace.last_edited else {
            return Ok(false);
        };
        Ok(match self.backups.latest(workspace.id).await? {
            Some(newest) => newest.created_at < last_edited.timestamp_millis(),
            None => true,
        })
    }

    /// Runs a single pass. Workspaces are backed up concurrently; a failure
    /// on one does not stop the others.
    pub async fn run_once(&self) -> AutoBackupReport {
        let mut report = AutoBackupReport::default();
        let mut tasks = JoinSet::new();

        for workspace in self.registry.all() {
            match self.needs_backup(&workspace).await {
                Ok(true) => {
                    let backups = self.backups.clone();
                    let id = workspace.id;
                    tasks.spawn(async move { (id, backups.backup(id).await) });
                }
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(workspace_id = %workspace.id, error = %e, "could not inspect backups");
                    report.failed += 1;
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(_))) => report.created += 1,
                Ok((id, Err(e))) => {
                    warn!(workspace_id = %id, error = %e, "auto-backup failed");
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "auto-backup task panicked");
                    report.failed += 1;
                }
            }
        }

        debug!(
            created = report.created,
            skipped = report.skipped,
            failed = report.failed,
            "auto-backup pass finished"
        );
        report
    }

    /// Starts the timer. The first pass runs one full interval from now.
    /// Abort the returned handle to stop it.
    pub fn spawn(self) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        info!(interval_secs = period.as_secs(), only_modified = self.config.only_modified, "auto-backup started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = self.run_once().await;
                if report.created > 0 || report.failed > 0 {
                    info!(created = report.created, failed = report.failed, "auto-backup pass");
                }
            }
        })
    }
}
