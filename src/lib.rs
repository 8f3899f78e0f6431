pub mod backup;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod registry;
pub mod service;
pub mod storage;
pub mod workspace;

pub use backup::{AutoBackupScheduler, Backup, BackupProfile, BackupService, BackupStorage};
pub use config::BuildWorldConfig;
pub use error::BuildWorldError;
pub use events::{Event, EventDispatcher, EventKind, EventObserver, ModificationKind};
pub use lifecycle::{LifecycleController, SignalOutcome, StatusChange};
pub use registry::{RemovedWorkspace, WorkspaceKey, WorkspaceRegistry};
pub use service::WorkspaceService;
pub use storage::{BackendRegistry, StorageBackend};
pub use workspace::{Builder, Visibility, Workspace, WorkspaceStatus, WorldType};

/// Re-export commonly used types
pub type Result<T> = std::result::Result<T, BuildWorldError>;
