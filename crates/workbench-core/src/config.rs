use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "workbench";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct CoreConfig {
    pub paths: PathsConfig,
    pub env_manager: EnvManagerConfig,
    pub process: ProcessConfig,
    pub notebook: NotebookConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: Option<PathBuf>,
    pub settings_file: Option<PathBuf>,
    pub envs_dir: Option<PathBuf>,
    pub journal_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnvManagerConfig {
    pub executable: String,
    /// The only channel packages may come from; implicit defaults are excluded.
    pub channel: String,
    pub base_packages: Vec<String>,
}

impl Default for EnvManagerConfig {
    fn default() -> Self {
        Self {
            executable: "micromamba".to_string(),
            channel: "conda-forge".to_string(),
            base_packages: vec!["python".to_string(), "git".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessConfig {
    /// Per-invocation limit; 0 disables it.
    pub timeout_secs: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self { timeout_secs: 1800 }
    }
}

impl ProcessConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotebookConfig {
    pub command: Vec<String>,
    pub port: u16,
}

impl Default for NotebookConfig {
    fn default() -> Self {
        Self {
            command: vec!["jupyter".to_string(), "notebook".to_string()],
            port: 8888,
        }
    }
}

impl CoreConfig {
    pub fn load(path: &Path) -> CoreResult<Self> {
        let data = std::fs::read_to_string(path)?;
        toml::from_str(&data).map_err(|source| CoreError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Like [`CoreConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file absent, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn default_config_file() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
    }

    pub fn data_dir(&self) -> CoreResult<PathBuf> {
        if let Some(dir) = &self.paths.data_dir {
            return Ok(dir.clone());
        }
        dirs::data_local_dir()
            .map(|dir| dir.join(APP_DIR))
            .ok_or_else(|| {
                CoreError::Config(
                    "no data directory for this platform; set paths.data_dir".to_string(),
                )
            })
    }

    pub fn settings_file(&self) -> CoreResult<PathBuf> {
        match &self.paths.settings_file {
            Some(path) => Ok(path.clone()),
            None => Ok(self.data_dir()?.join("settings.json")),
        }
    }

    pub fn envs_dir(&self) -> CoreResult<PathBuf> {
        match &self.paths.envs_dir {
            Some(path) => Ok(path.clone()),
            None => Ok(self.data_dir()?.join("plugin-envs")),
        }
    }

    pub fn journal_file(&self) -> CoreResult<PathBuf> {
        match &self.paths.journal_file {
            Some(path) => Ok(path.clone()),
            None => Ok(self.data_dir()?.join("pending-envs.json")),
        }
    }
}
