//! Error taxonomy for the supervisor, stores and configuration loader

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the manager core
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("no configuration for instance '{name}' at {}", path.display())]
    ConfigNotFound { name: String, path: PathBuf },

    #[error("invalid configuration for instance '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },

    #[error("executable not found: {}", .0.display())]
    ExecutableNotFound(PathBuf),

    #[error("instance '{0}' is not running")]
    InstanceNotRunning(String),

    #[error("instance '{0}' is already running")]
    AlreadyRunning(String),

    #[error("instance '{0}' was started by another manager session; its stdin is not attached here")]
    StdinDetached(String),

    #[error("failed to signal process {pid}: {reason}")]
    ProcessSignalFailed { pid: u32, reason: String },

    #[error("failed to spawn instance '{name}'")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("run #{start_id} of instance '{name}' does not exist")]
    RunNotFound { name: String, start_id: i64 },

    #[error("store file {} is corrupted: {reason}", path.display())]
    StoreCorrupted { path: PathBuf, reason: String },

    #[error("store still busy after {attempts} attempts")]
    StoreBusy {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for ManagerError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;
