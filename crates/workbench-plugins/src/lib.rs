pub mod bus;
pub mod error;
pub mod installer;
pub mod journal;
pub mod locks;
pub mod manifest;
pub mod notebook;
pub mod provision;
pub mod reader;
pub mod registry;

#[cfg(test)]
mod testing;

pub use bus::{ChannelSink, NullSink, ProgressEvent, ProgressSink};
pub use error::{
    InstallError, ManifestError, ProvisionError, RegistryError, RemoveError, SetupError,
    StageError,
};
pub use installer::{CleanupReport, PluginInstaller, RemoveOutcome, Stage};
pub use journal::{EnvJournal, PendingEnv};
pub use manifest::PluginManifest;
pub use notebook::{NotebookError, NotebookLauncher};
pub use provision::{
    EnvironmentProvisioner, PluginIdentity, ProvisionObserver, ProvisionedEnvironment,
};
pub use reader::{InstallRequest, ManifestReader};
pub use registry::{PluginKey, PluginRecord, PluginRegistry, RecordKind};
