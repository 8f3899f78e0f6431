use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum BuildWorldError {
    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("A workspace named '{0}' already exists")]
    DuplicateName(String),

    #[error("Invalid workspace name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Backup storage error during {operation} for workspace {workspace_id}: {source}")]
    BackupStorage {
        workspace_id: Uuid,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Retention violated for workspace {workspace_id}: {count} backups recorded, limit is {max}")]
    RetentionViolation {
        workspace_id: Uuid,
        count: usize,
        max: usize,
    },

    #[error("Another backup operation is already running for workspace {0}")]
    RestoreConflict(Uuid),

    #[error("Checksum mismatch for backup artifact {key}")]
    ChecksumMismatch { key: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("CBOR serialization error: {0}")]
    SerializationCbor(#[from] serde_cbor::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Background task failed: {0}")]
    TaskJoin(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl BuildWorldError {
    /// Whether retrying the failed operation once has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        let io = match self {
            BuildWorldError::BackupStorage { source, .. } => source,
            BuildWorldError::FileSystem(source) => source,
            _ => return false,
        };
        matches!(
            io.kind(),
            std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::WouldBlock
        )
    }

    /// Message suitable for showing to whoever requested the operation.
    pub fn user_message(&self, operation: &str) -> String {
        match (operation, self) {
            (_, BuildWorldError::RestoreConflict(_)) => {
                "another backup operation is running, try again shortly".to_string()
            }
            ("create", _) => "backup failed, no changes made".to_string(),
            ("restore", _) => "restore failed, workspace unchanged".to_string(),
            _ => self.to_string(),
        }
    }

    pub(crate) fn backup_io(workspace_id: Uuid, operation: &'static str, err: Self) -> Self {
        match err {
            BuildWorldError::FileSystem(source) => BuildWorldError::BackupStorage {
                workspace_id,
                operation,
                source,
            },
            other => other,
        }
    }
}

impl From<anyhow::Error> for BuildWorldError {
    fn from(err: anyhow::Error) -> Self {
        BuildWorldError::Unknown(err.to_string())
    }
}

impl From<tokio::task::JoinError> for BuildWorldError {
    fn from(err: tokio::task::JoinError) -> Self {
        BuildWorldError::TaskJoin(err.to_string())
    }
}
