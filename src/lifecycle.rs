use crate::events::{ChangeReason, EventDispatcher, EventKind, LifecycleEvent, ModificationKind};
use crate::registry::WorkspaceRegistry;
use crate::workspace::WorkspaceStatus;
use crate::BuildWorldError;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub workspace_id: Uuid,
    pub old_status: WorkspaceStatus,
    pub new_status: WorkspaceStatus,
}

/// Result of delivering a modification signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    /// The workspace moved from NOT_STARTED to IN_PROGRESS.
    Advanced(StatusChange),
    Unchanged,
    /// Archived workspaces drop modification signals.
    Rejected,
}

/// Applies status transitions to registered workspaces.
///
/// Only two rules are enforced: the first modification signal advances a
/// NOT_STARTED workspace to IN_PROGRESS, and archived workspaces ignore
/// signals. Administrative transitions are always allowed.
pub struct LifecycleController {
    registry: Arc<WorkspaceRegistry>,
    dispatcher: Arc<EventDispatcher>,
}

impl LifecycleController {
    pub fn new(registry: Arc<WorkspaceRegistry>, dispatcher: Arc<EventDispatcher>) -> Self {
        Self { registry, dispatcher }
    }

    pub fn status(&self, workspace_id: Uuid) -> crate::Result<WorkspaceStatus> {
        self.registry
            .lookup_by_id(workspace_id)
            .map(|ws| ws.status)
            .ok_or_else(|| self.not_found(workspace_id, "status"))
    }

    pub fn apply_modification_signal(
        &self,
        workspace_id: Uuid,
        kind: ModificationKind,
    ) -> crate::Result<SignalOutcome> {
        // Check and transition happen under the workspace lock, so concurrent
        // signals produce exactly one transition.
        let outcome = self
            .registry
            .update(workspace_id, |ws| match ws.status {
                WorkspaceStatus::Archive => SignalOutcome::Rejected,
                WorkspaceStatus::NotStarted => {
                    ws.last_edited = Some(Utc::now());
                    ws.status = WorkspaceStatus::InProgress;
                    SignalOutcome::Advanced(StatusChange {
                        workspace_id,
                        old_status: WorkspaceStatus::NotStarted,
                        new_status: WorkspaceStatus::InProgress,
                    })
                }
                _ => {
                    ws.last_edited = Some(Utc::now());
                    SignalOutcome::Unchanged
                }
            })
            .map_err(|e| self.log_failure(workspace_id, "modification_signal", e))?;

        match &outcome {
            SignalOutcome::Advanced(change) => {
                info!(workspace_id = %workspace_id, ?kind, "workspace is now in progress");
                self.emit(change, ChangeReason::Modification(kind));
            }
            SignalOutcome::Rejected => {
                debug!(workspace_id = %workspace_id, ?kind, "signal dropped for archived workspace");
            }
            SignalOutcome::Unchanged => {}
        }
        Ok(outcome)
    }

    pub fn set_status(
        &self,
        workspace_id: Uuid,
        new_status: WorkspaceStatus,
        actor: Option<&str>,
    ) -> crate::Result<StatusChange> {
        let change = self
            .registry
            .update(workspace_id, |ws| {
                let old_status = ws.status;
                if new_status == WorkspaceStatus::Hidden {
                    if old_status != WorkspaceStatus::Hidden {
                        ws.status_before_hidden = Some(old_status);
                    }
                } else {
                    ws.status_before_hidden = None;
                }
                ws.status = new_status;
                StatusChange {
                    workspace_id,
                    old_status,
                    new_status,
                }
            })
            .map_err(|e| self.log_failure(workspace_id, "set_status", e))?;

        info!(
            workspace_id = %workspace_id,
            old = %change.old_status,
            new = %change.new_status,
            actor = actor.unwrap_or("-"),
            "workspace status set"
        );
        self.emit(
            &change,
            ChangeReason::Administrative {
                actor: actor.map(str::to_string),
            },
        );
        Ok(change)
    }

    /// Returns a hidden workspace to the status it had before hiding.
    /// Workspaces that are not hidden are left alone.
    pub fn unhide(&self, workspace_id: Uuid) -> crate::Result<Option<StatusChange>> {
        let change = self
            .registry
            .update(workspace_id, |ws| {
                if ws.status != WorkspaceStatus::Hidden {
                    return None;
                }
                let restored = ws.status_before_hidden.take().unwrap_or(WorkspaceStatus::NotStarted);
                ws.status = restored;
                Some(StatusChange {
                    workspace_id,
                    old_status: WorkspaceStatus::Hidden,
                    new_status: restored,
                })
            })
            .map_err(|e| self.log_failure(workspace_id, "unhide", e))?;

        if let Some(change) = &change {
            self.emit(change, ChangeReason::Unhidden);
        }
        Ok(change)
    }

    fn emit(&self, change: &StatusChange, reason: ChangeReason) {
        self.dispatcher.publish(EventKind::Lifecycle(LifecycleEvent {
            workspace_id: change.workspace_id,
            old_status: change.old_status,
            new_status: change.new_status,
            reason,
        }));
    }

    fn not_found(&self, workspace_id: Uuid, operation: &str) -> BuildWorldError {
        self.log_failure(
            workspace_id,
            operation,
            BuildWorldError::WorkspaceNotFound(workspace_id.to_string()),
        )
    }

    fn log_failure(&self, workspace_id: Uuid, operation: &str, err: BuildWorldError) -> BuildWorldError {
        warn!(workspace_id = %workspace_id, operation, error = %err, "lifecycle operation failed");
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventObserver};
    use crate::storage::{MemoryBackend, RecordCodec};
    use crate::workspace::{Visibility, WorldType, Workspace};
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<Event>>);

    impl EventObserver for Recorder {
        fn on_event(&self, event: &Event) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn setup() -> (LifecycleController, Arc<WorkspaceRegistry>, Arc<Recorder>) {
        let registry = Arc::new(WorkspaceRegistry::new(
            Arc::new(MemoryBackend::new()),
            RecordCodec::default(),
        ));
        let dispatcher = Arc::new(EventDispatcher::new(16));
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        dispatcher.register_observer(recorder.clone());
        (LifecycleController::new(registry.clone(), dispatcher), registry, recorder)
    }

    fn register(registry: &WorkspaceRegistry, name: &str) -> Uuid {
        let ws = Workspace::new(name, None, WorldType::Normal, Visibility::Public);
        let id = ws.id;
        registry.register(ws).unwrap();
        id
    }

    #[test]
    fn test_first_signal_advances_once() {
        let (controller, registry, recorder) = setup();
        let id = register(&registry, "alpha");

        let outcome = controller.apply_modification_signal(id, ModificationKind::BlockPlace).unwrap();
        assert!(matches!(outcome, SignalOutcome::Advanced(_)));
        assert_eq!(controller.status(id).unwrap(), WorkspaceStatus::InProgress);
        assert!(registry.lookup(id).unwrap().last_edited.is_some());

        let outcome = controller.apply_modification_signal(id, ModificationKind::BlockBreak).unwrap();
        assert_eq!(outcome, SignalOutcome::Unchanged);

        let events = recorder.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0].kind {
            EventKind::Lifecycle(e) => {
                assert_eq!(e.old_status, WorkspaceStatus::NotStarted);
                assert_eq!(e.new_status, WorkspaceStatus::InProgress);
                assert_eq!(e.reason, ChangeReason::Modification(ModificationKind::BlockPlace));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_archived_workspace_rejects_signals() {
        let (controller, registry, recorder) = setup();
        let id = register(&registry, "museum");
        controller.set_status(id, WorkspaceStatus::Archive, Some("admin")).unwrap();

        for kind in [ModificationKind::BlockBreak, ModificationKind::Command, ModificationKind::External] {
            assert_eq!(controller.apply_modification_signal(id, kind).unwrap(), SignalOutcome::Rejected);
        }
        let ws = registry.lookup(id).unwrap();
        assert_eq!(ws.status, WorkspaceStatus::Archive);
        assert!(ws.last_edited.is_none());
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_set_status_is_never_illegal() {
        let (controller, registry, _) = setup();
        let id = register(&registry, "alpha");

        let change = controller.set_status(id, WorkspaceStatus::Finished, None).unwrap();
        assert_eq!(change.old_status, WorkspaceStatus::NotStarted);
        let change = controller.set_status(id, WorkspaceStatus::NotStarted, None).unwrap();
        assert_eq!(change.old_status, WorkspaceStatus::Finished);
    }

    #[test]
    fn test_hidden_returns_to_previous_status() {
        let (controller, registry, recorder) = setup();
        let id = register(&registry, "secret");
        controller.set_status(id, WorkspaceStatus::AlmostFinished, None).unwrap();
        controller.set_status(id, WorkspaceStatus::Hidden, None).unwrap();
        // Hiding twice keeps the original status.
        controller.set_status(id, WorkspaceStatus::Hidden, None).unwrap();

        let change = controller.unhide(id).unwrap().unwrap();
        assert_eq!(change.new_status, WorkspaceStatus::AlmostFinished);
        assert!(controller.unhide(id).unwrap().is_none());
        assert!(registry.lookup(id).unwrap().status_before_hidden.is_none());

        let last = recorder.0.lock().unwrap().last().cloned().unwrap();
        assert!(matches!(last.kind, EventKind::Lifecycle(LifecycleEvent { reason: ChangeReason::Unhidden, .. })));
    }

    #[test]
    fn test_unknown_workspace_is_an_error() {
        let (controller, _, _) = setup();
        let id = Uuid::new_v4();
        assert!(matches!(
            controller.apply_modification_signal(id, ModificationKind::External),
            Err(BuildWorldError::WorkspaceNotFound(_))
        ));
        assert!(matches!(
            controller.set_status(id, WorkspaceStatus::Finished, None),
            Err(BuildWorldError::WorkspaceNotFound(_))
        ));
        assert!(controller.status(id).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_signals_transition_once() {
        let (controller, registry, recorder) = setup();
        let controller = Arc::new(controller);
        let id = register(&registry, "busy");

        let mut handles = Vec::new();
        for _ in 0..32 {
            let controller = controller.clone();
            handles.push(tokio::spawn(async move {
                controller.apply_modification_signal(id, ModificationKind::BlockPlace).unwrap()
            }));
        }
        let mut advanced = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), SignalOutcome::Advanced(_)) {
                advanced += 1;
            }
        }

        assert_eq!(advanced, 1);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
        assert_eq!(controller.status(id).unwrap(), WorkspaceStatus::InProgress);
    }
}
