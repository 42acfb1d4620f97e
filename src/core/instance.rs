//! Instance model - Launch configuration, run lifetimes and the current-run pointer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Status of a single run of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Run accepted, process not yet spawned
    Starting,
    /// Process handle obtained
    Running,
    /// Stop requested, waiting for the process to exit
    Stopping,
    /// Process exited after a stop request or with success
    Stopped,
    /// Process exited unexpectedly or vanished
    Crashed,
}

impl RunStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Crashed => "Crashed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Starting" => Ok(Self::Starting),
            "Running" => Ok(Self::Running),
            "Stopping" => Ok(Self::Stopping),
            "Stopped" => Ok(Self::Stopped),
            "Crashed" => Ok(Self::Crashed),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// Resolved launch configuration for an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Instance name (directory name under the instances directory)
    pub name: String,
    /// Absolute path to the executable
    pub executable_path: PathBuf,
    /// Command line arguments
    pub args: Vec<String>,
    /// Working directory for the process
    pub work_dir: PathBuf,
}

impl InstanceConfig {
    pub fn new(
        name: impl Into<String>,
        executable_path: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            executable_path: executable_path.into(),
            args: Vec::new(),
            work_dir: work_dir.into(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// One execution lifetime of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub instance_name: String,
    /// Strictly increasing per instance
    pub start_id: i64,
    pub start_time: DateTime<Utc>,
    pub pid: Option<u32>,
    pub status: RunStatus,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

impl RunRecord {
    /// Get run duration, up to now for active runs
    pub fn duration(&self) -> chrono::Duration {
        self.ended_at.unwrap_or_else(Utc::now) - self.start_time
    }

    /// Format duration as human-readable string
    pub fn duration_string(&self) -> String {
        let secs = self.duration().num_seconds().max(0);
        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else if secs < 86400 {
            format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
        } else {
            format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
        }
    }
}

/// Durable "is it running now" pointer for an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    pub instance_name: String,
    pub pid: u32,
    pub start_id: i64,
    pub start_time: DateTime<Utc>,
    /// OS-reported process start time (seconds since epoch), guards against pid reuse
    #[serde(default)]
    pub process_started_at: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_label() {
        for status in [
            RunStatus::Starting,
            RunStatus::Running,
            RunStatus::Stopping,
            RunStatus::Stopped,
            RunStatus::Crashed,
        ] {
            assert_eq!(status.label().parse::<RunStatus>().unwrap(), status);
        }
        assert!("Paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_active_statuses() {
        assert!(RunStatus::Starting.is_active());
        assert!(RunStatus::Stopping.is_active());
        assert!(!RunStatus::Stopped.is_active());
        assert!(!RunStatus::Crashed.is_active());
    }

    #[test]
    fn test_state_without_fingerprint_deserializes() {
        let json = r#"{"instance_name":"lobby","pid":42,"start_id":3,"start_time":"2024-05-01T10:00:00Z"}"#;
        let state: InstanceState = serde_json::from_str(json).unwrap();
        assert_eq!(state.pid, 42);
        assert_eq!(state.process_started_at, None);
    }
}
