//! Manager settings management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use super::error::Result;

/// File name of the settings inside the data directory
pub const SETTINGS_FILE: &str = "settings.json";

/// Manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Custom data directory (log database, state file)
    pub data_directory: Option<PathBuf>,
    /// Custom instances directory (one subdirectory per instance)
    pub instances_directory: Option<PathBuf>,
    /// Line written to an instance's stdin to request a graceful shutdown
    pub stop_command: String,
    /// Attempts before a busy log store gives up
    pub busy_retry_attempts: u32,
    /// Backoff before the first retry, doubled on each further attempt
    pub busy_retry_backoff_ms: u64,
    /// Keep finished runs for N days (0 = forever)
    pub log_retention_days: u32,
    /// Enable debug logging
    pub debug_logging: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_directory: None,
            instances_directory: None,
            stop_command: "stop".to_string(),
            busy_retry_attempts: 5,
            busy_retry_backoff_ms: 50,
            log_retention_days: 0,
            debug_logging: false,
        }
    }
}

impl Settings {
    /// Load settings from `<data_dir>/settings.json`, falling back to defaults.
    ///
    /// A file that cannot be parsed is ignored with a warning.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(SETTINGS_FILE);
        let mut settings = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Settings>(&text) {
                Ok(settings) => {
                    debug!("Settings loaded from {:?}", path);
                    settings
                }
                Err(e) => {
                    warn!("Ignoring unreadable settings file {:?}: {}", path, e);
                    Settings::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
            Err(e) => return Err(e.into()),
        };

        if settings.data_directory.is_none() {
            settings.data_directory = Some(data_dir.to_path_buf());
        }
        settings.validate();
        Ok(settings)
    }

    /// Save settings to the data directory
    pub fn save(&self) -> Result<()> {
        let dir = self.get_data_directory();
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(SETTINGS_FILE), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Default data directory when none is configured
    pub fn default_data_directory() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("instancekeeper")
    }

    /// Get the data directory, using default if not set
    pub fn get_data_directory(&self) -> PathBuf {
        self.data_directory
            .clone()
            .unwrap_or_else(Self::default_data_directory)
    }

    /// Get the instances directory
    pub fn get_instances_directory(&self) -> PathBuf {
        self.instances_directory
            .clone()
            .unwrap_or_else(|| self.get_data_directory().join("instances"))
    }

    /// Path of the log database
    pub fn get_log_database_path(&self) -> PathBuf {
        self.get_data_directory().join("logs.db")
    }

    /// Path of the instance state file
    pub fn get_state_path(&self) -> PathBuf {
        self.get_data_directory().join("state.json")
    }

    pub fn busy_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.busy_retry_backoff_ms)
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        self.busy_retry_attempts = self.busy_retry_attempts.clamp(1, 20);
        self.busy_retry_backoff_ms = self.busy_retry_backoff_ms.clamp(1, 5_000);
        if self.stop_command.trim().is_empty() {
            self.stop_command = "stop".to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_when_missing() {
        let temp = tempdir().unwrap();
        let settings = Settings::load(temp.path()).unwrap();
        assert_eq!(settings.stop_command, "stop");
        assert_eq!(settings.busy_retry_attempts, 5);
        assert_eq!(settings.get_data_directory(), temp.path());
        assert_eq!(settings.get_instances_directory(), temp.path().join("instances"));
        assert_eq!(settings.get_log_database_path(), temp.path().join("logs.db"));
    }

    #[test]
    fn test_partial_file_and_validation() {
        let temp = tempdir().unwrap();
        std::fs::write(
            temp.path().join(SETTINGS_FILE),
            r#"{"stop_command": "  ", "busy_retry_attempts": 0, "log_retention_days": 14}"#,
        )
        .unwrap();

        let settings = Settings::load(temp.path()).unwrap();
        assert_eq!(settings.stop_command, "stop");
        assert_eq!(settings.busy_retry_attempts, 1);
        assert_eq!(settings.log_retention_days, 14);
        assert_eq!(settings.busy_retry_backoff_ms, 50);
    }

    #[test]
    fn test_unreadable_file_falls_back() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join(SETTINGS_FILE), "not json").unwrap();
        let settings = Settings::load(temp.path()).unwrap();
        assert_eq!(settings.stop_command, "stop");
    }

    #[test]
    fn test_save_round_trip() {
        let temp = tempdir().unwrap();
        let mut settings = Settings::load(temp.path()).unwrap();
        settings.stop_command = "end".to_string();
        settings.save().unwrap();

        let reloaded = Settings::load(temp.path()).unwrap();
        assert_eq!(reloaded, settings);
    }
}
