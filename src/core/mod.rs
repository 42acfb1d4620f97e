//! Core module - Instance configuration, run bookkeeping, ingestion and supervision

pub mod config;
mod error;
mod ingest;
mod instance;
mod log_entry;
pub mod settings;
mod supervisor;

pub use config::{ConfigFile, InstanceRegistry};
pub use error::{ManagerError, Result};
pub use ingest::StreamIngester;
pub use instance::{InstanceConfig, InstanceState, RunRecord, RunStatus};
pub use log_entry::{
    parse_line, LogEntry, LogQuery, ParsedLine, RunSelector, StreamKind, FALLBACK_LEVEL,
    FALLBACK_THREAD,
};
pub use settings::Settings;
pub use supervisor::{InstanceReport, ProcessSupervisor, ReconcileReport, RunExit, StartedRun};
