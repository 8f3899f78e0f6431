use crate::workspace::WorkspaceStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// What kind of content change produced a modification signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModificationKind {
    BlockBreak,
    BlockPlace,
    Command,
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeReason {
    /// The automatic NOT_STARTED -> IN_PROGRESS edge.
    Modification(ModificationKind),
    Administrative { actor: Option<String> },
    Unhidden,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub workspace_id: Uuid,
    pub old_status: WorkspaceStatus,
    pub new_status: WorkspaceStatus,
    pub reason: ChangeReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupOperation {
    Create,
    Restore,
    Delete,
    Evict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupOutcome {
    Succeeded,
    Failed { error: String },
    Rejected { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEvent {
    pub workspace_id: Uuid,
    pub backup_key: Option<String>,
    pub operation: BackupOperation,
    pub outcome: BackupOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    Created { workspace_id: Uuid, name: String },
    Deleted { workspace_id: Uuid, name: String, backups_purged: usize },
    Renamed { workspace_id: Uuid, old_name: String, new_name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Lifecycle(LifecycleEvent),
    Backup(BackupEvent),
    Registry(RegistryEvent),
}

impl EventKind {
    pub fn workspace_id(&self) -> Uuid {
        match self {
            EventKind::Lifecycle(e) => e.workspace_id,
            EventKind::Backup(e) => e.workspace_id,
            EventKind::Registry(RegistryEvent::Created { workspace_id, .. })
            | EventKind::Registry(RegistryEvent::Deleted { workspace_id, .. })
            | EventKind::Registry(RegistryEvent::Renamed { workspace_id, .. }) => *workspace_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, sequence_number: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            sequence_number,
            timestamp: Utc::now(),
        }
    }
}

/// Synchronous listener registered with the dispatcher.
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &Event);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Fans out lifecycle, backup and registry events.
///
/// Channel subscribers each get their own copy of every event published after
/// they subscribed; slow subscribers lose the oldest events rather than
/// blocking publishers. Observers are called inline, in registration order.
pub struct EventDispatcher {
    sender: broadcast::Sender<Event>,
    observers: RwLock<Vec<(ObserverId, Arc<dyn EventObserver>)>>,
    sequence_counter: AtomicU64,
    next_observer: AtomicU64,
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            observers: RwLock::new(Vec::new()),
            sequence_counter: AtomicU64::new(0),
            next_observer: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn register_observer(&self, observer: Arc<dyn EventObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        match self.observers.write() {
            Ok(mut observers) => observers.push((id, observer)),
            Err(e) => warn!(error = %e, "observer list poisoned, observer not registered"),
        }
        id
    }

    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        match self.observers.write() {
            Ok(mut observers) => {
                let before = observers.len();
                observers.retain(|(existing, _)| *existing != id);
                before != observers.len()
            }
            Err(_) => false,
        }
    }

    pub fn publish(&self, kind: EventKind) -> Event {
        let sequence = self.sequence_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Event::new(kind, sequence);

        // Snapshot so observers may (un)register from inside on_event.
        let observers: Vec<Arc<dyn EventObserver>> = match self.observers.read() {
            Ok(guard) => guard.iter().map(|(_, o)| o.clone()).collect(),
            Err(_) => Vec::new(),
        };
        for observer in observers {
            observer.on_event(&event);
        }

        // No receivers is fine.
        let _ = self.sender.send(event.clone());
        debug!(sequence, workspace_id = %event.kind.workspace_id(), "event published");
        event
    }

    pub fn last_sequence_number(&self) -> u64 {
        self.sequence_counter.load(Ordering::SeqCst)
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Collector(Mutex<Vec<u64>>);

    impl EventObserver for Collector {
        fn on_event(&self, event: &Event) {
            self.0.lock().unwrap().push(event.sequence_number);
        }
    }

    fn lifecycle(id: Uuid) -> EventKind {
        EventKind::Lifecycle(LifecycleEvent {
            workspace_id: id,
            old_status: WorkspaceStatus::NotStarted,
            new_status: WorkspaceStatus::InProgress,
            reason: ChangeReason::Modification(ModificationKind::BlockPlace),
        })
    }

    #[test]
    fn test_publish_without_listeners() {
        let dispatcher = EventDispatcher::new(4);
        let event = dispatcher.publish(lifecycle(Uuid::new_v4()));
        assert_eq!(event.sequence_number, 1);
        assert_eq!(dispatcher.last_sequence_number(), 1);
    }

    #[test]
    fn test_observers_receive_until_unregistered() {
        let dispatcher = EventDispatcher::new(4);
        let collector = Arc::new(Collector(Mutex::new(Vec::new())));
        let id = dispatcher.register_observer(collector.clone());

        dispatcher.publish(lifecycle(Uuid::new_v4()));
        assert!(dispatcher.unregister_observer(id));
        assert!(!dispatcher.unregister_observer(id));
        dispatcher.publish(lifecycle(Uuid::new_v4()));

        assert_eq!(*collector.0.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_channel_subscribers_get_events_in_order() {
        let dispatcher = EventDispatcher::new(8);
        let mut rx = dispatcher.subscribe();
        let id = Uuid::new_v4();
        dispatcher.publish(lifecycle(id));
        dispatcher.publish(EventKind::Registry(RegistryEvent::Renamed {
            workspace_id: id,
            old_name: "a".into(),
            new_name: "b".into(),
        }));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.sequence_number < second.sequence_number);
        assert_eq!(second.kind.workspace_id(), id);
    }
}
