//! Instance configuration - `<instances_dir>/<name>/instance.json`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::{ManagerError, Result};
use super::instance::InstanceConfig;

/// File name of an instance's configuration inside its directory
pub const CONFIG_FILE: &str = "instance.json";

/// On-disk shape of `instance.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigFile {
    /// Any executable with arguments
    Command {
        executable: PathBuf,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        work_dir: Option<PathBuf>,
    },
    /// A Java server jar launched as `<jdk> [jvm_args] -jar <jar> [server_args]`
    JavaServer {
        jdk_path: PathBuf,
        server_jar: PathBuf,
        #[serde(default)]
        jvm_args: Vec<String>,
        #[serde(default)]
        server_args: Vec<String>,
    },
}

/// Resolves instance names to launch configurations
pub struct InstanceRegistry {
    instances_dir: PathBuf,
}

impl InstanceRegistry {
    pub fn new(instances_dir: impl Into<PathBuf>) -> Self {
        Self {
            instances_dir: instances_dir.into(),
        }
    }

    pub fn instances_dir(&self) -> &Path {
        &self.instances_dir
    }

    /// Directory holding an instance's files
    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.instances_dir.join(name)
    }

    /// Load and validate the launch configuration of an instance
    pub fn resolve_config(&self, name: &str) -> Result<InstanceConfig> {
        let dir = self.checked_instance_dir(name)?;
        let path = dir.join(CONFIG_FILE);
        if !path.is_file() {
            return Err(ManagerError::ConfigNotFound {
                name: name.to_string(),
                path,
            });
        }

        let text = std::fs::read_to_string(&path)?;
        let file: ConfigFile =
            serde_json::from_str(&text).map_err(|e| ManagerError::InvalidConfig {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let config = Self::resolve_paths(name, &dir, file)?;
        debug!(
            "Resolved '{}' to {:?} {:?} in {:?}",
            name, config.executable_path, config.args, config.work_dir
        );
        Ok(config)
    }

    fn resolve_paths(name: &str, dir: &Path, file: ConfigFile) -> Result<InstanceConfig> {
        match file {
            ConfigFile::Command {
                executable,
                args,
                work_dir,
            } => {
                let executable_path = absolute(dir, &executable);
                if !executable_path.is_file() {
                    return Err(ManagerError::ExecutableNotFound(executable_path));
                }
                let work_dir = work_dir
                    .map(|w| absolute(dir, &w))
                    .unwrap_or_else(|| dir.to_path_buf());
                Ok(InstanceConfig::new(name, executable_path, work_dir).with_args(args))
            }
            ConfigFile::JavaServer {
                jdk_path,
                server_jar,
                jvm_args,
                server_args,
            } => {
                let jdk = absolute(dir, &jdk_path);
                if !jdk.is_file() {
                    return Err(ManagerError::ExecutableNotFound(jdk));
                }
                let jar = absolute(dir, &server_jar);
                if !jar.is_file() {
                    return Err(ManagerError::ExecutableNotFound(jar));
                }

                let work_dir = jar
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| dir.to_path_buf());
                let mut args = jvm_args;
                args.push("-jar".to_string());
                args.push(jar.to_string_lossy().into_owned());
                args.extend(server_args);
                Ok(InstanceConfig::new(name, jdk, work_dir).with_args(args))
            }
        }
    }

    /// Names of all instance directories, sorted
    pub fn list_instances(&self) -> Result<Vec<String>> {
        if !self.instances_dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.instances_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Write an instance's configuration, creating its directory
    pub fn save_config(&self, name: &str, config: &ConfigFile) -> Result<PathBuf> {
        let dir = self.checked_instance_dir(name)?;
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(CONFIG_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(config)?)?;
        info!("Saved configuration for '{}' to {:?}", name, path);
        Ok(path)
    }

    fn checked_instance_dir(&self, name: &str) -> Result<PathBuf> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\']);
        if !valid {
            return Err(ManagerError::InvalidConfig {
                name: name.to_string(),
                reason: "instance names must be a single path component".to_string(),
            });
        }
        Ok(self.instance_dir(name))
    }
}

fn absolute(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
