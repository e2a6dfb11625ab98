use crate::installer::Stage;
use std::path::PathBuf;
use thiserror::Error;
use workbench_core::ProcessFailure;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("no manifest at {0}")]
    NotFound(PathBuf),
    #[error("could not read manifest {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not fetch manifest from {url}")]
    Fetch {
        url: String,
        #[source]
        source: ProcessFailure,
    },
    #[error("could not prepare the version-control environment")]
    Vcs(#[source] ProvisionError),
    #[error("manifest {path} is not valid TOML")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("manifest {path} has no [tool.natcap.invest] section")]
    MissingSection { path: PathBuf },
    #[error("manifest {path} is missing required field `{field}`")]
    MissingField { path: PathBuf, field: &'static str },
    #[error("manifest {path} has an invalid `{field}`: {reason}")]
    InvalidField {
        path: PathBuf,
        field: &'static str,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("could not prepare {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("environment {0} does not exist")]
    NotFound(PathBuf),
    #[error("creating environment {prefix} failed")]
    Create {
        prefix: PathBuf,
        #[source]
        source: ProcessFailure,
    },
    #[error("installing {target} into {prefix} failed")]
    Install {
        prefix: PathBuf,
        target: String,
        #[source]
        source: ProcessFailure,
    },
    #[error("introspecting package {package} in {prefix} failed")]
    Introspect {
        prefix: PathBuf,
        package: String,
        #[source]
        source: ProcessFailure,
    },
    #[error("package {package} in {prefix} reported no usable identity: {detail}")]
    Identity {
        prefix: PathBuf,
        package: String,
        detail: String,
    },
    #[error("removing environment {prefix} failed")]
    Remove {
        prefix: PathBuf,
        #[source]
        source: ProcessFailure,
    },
}

impl ProvisionError {
    /// The environment prefix the failure concerns, if one was allocated.
    pub fn prefix(&self) -> Option<&PathBuf> {
        match self {
            ProvisionError::Io { .. } => None,
            ProvisionError::NotFound(prefix)
            | ProvisionError::Create { prefix, .. }
            | ProvisionError::Install { prefix, .. }
            | ProvisionError::Introspect { prefix, .. }
            | ProvisionError::Identity { prefix, .. }
            | ProvisionError::Remove { prefix, .. } => Some(prefix),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("could not read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is corrupt")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not write {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Error)]
#[error("plugin install failed while {stage}")]
pub struct InstallError {
    pub stage: Stage,
    /// Environment left on disk without a registry record.
    pub orphan: Option<PathBuf>,
    #[source]
    pub source: StageError,
}

impl InstallError {
    pub fn new(stage: Stage, source: impl Into<StageError>) -> Self {
        Self {
            stage,
            orphan: None,
            source: source.into(),
        }
    }

    pub fn with_orphan(mut self, prefix: PathBuf) -> Self {
        self.orphan = Some(prefix);
        self
    }
}

#[derive(Debug, Error)]
#[error("could not unregister plugin {key}")]
pub struct RemoveError {
    pub key: String,
    #[source]
    pub source: RegistryError,
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] workbench_core::CoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
