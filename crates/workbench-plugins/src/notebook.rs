use crate::provision::run_in_env;
use crate::registry::PluginRecord;
use std::path::{Path, PathBuf};
use thiserror::Error;
use workbench_core::{
    CommandSpec, CoreError, EnvManagerConfig, NotebookConfig, ProcessHandle, ProcessManager,
};

#[derive(Debug, Error)]
pub enum NotebookError {
    #[error("plugin {0} does not ship a notebook")]
    NoNotebook(String),
    #[error("environment {0} does not exist")]
    MissingEnvironment(PathBuf),
    #[error("notebook command is empty")]
    EmptyCommand,
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Starts a plugin's notebook server inside the plugin's own environment.
pub struct NotebookLauncher {
    manager: ProcessManager,
    env_manager: EnvManagerConfig,
    notebook: NotebookConfig,
}

impl NotebookLauncher {
    pub fn new(
        manager: ProcessManager,
        env_manager: EnvManagerConfig,
        notebook: NotebookConfig,
    ) -> Self {
        Self {
            manager,
            env_manager,
            notebook,
        }
    }

    pub fn url(&self) -> String {
        format!("http://localhost:{}/", self.notebook.port)
    }

    /// Relative notebook paths resolve against a local source checkout,
    /// otherwise against the environment prefix.
    fn working_dir(record: &PluginRecord) -> PathBuf {
        let source = Path::new(&record.source);
        if source.is_dir() {
            source.to_path_buf()
        } else {
            record.env.clone()
        }
    }

    pub fn command(&self, record: &PluginRecord) -> Result<CommandSpec, NotebookError> {
        let notebook = record
            .notebook_path
            .as_deref()
            .ok_or_else(|| NotebookError::NoNotebook(record.key().to_string()))?;
        if self.notebook.command.is_empty() {
            return Err(NotebookError::EmptyCommand);
        }
        let port = self.notebook.port.to_string();
        let command = self.notebook.command.iter().map(String::as_str);
        let spec = run_in_env(&self.env_manager, &record.env, command)
            .args(["--no-browser", "--port", port.as_str(), notebook])
            .current_dir(Self::working_dir(record));
        Ok(spec)
    }

    pub fn launch(&self, record: &PluginRecord) -> Result<ProcessHandle, NotebookError> {
        let spec = self.command(record)?;
        if !record.env.is_dir() {
            return Err(NotebookError::MissingEnvironment(record.env.clone()));
        }
        let handle = self.manager.spawn(&spec)?;
        tracing::info!(plugin_id = %record.key(), url = %self.url(), "notebook server started");
        Ok(handle)
    }

    pub fn is_running(&self, handle: &ProcessHandle) -> bool {
        self.manager.is_running(handle)
    }

    pub fn stop(&self, handle: &ProcessHandle) -> Result<(), NotebookError> {
        self.manager.stop(handle)?;
        Ok(())
    }
}
