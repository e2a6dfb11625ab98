use crate::error::ManifestError;
use crate::manifest::{PluginManifest, MANIFEST_FILE};
use crate::provision::{run_in_env, EnvironmentProvisioner};
use std::path::{Path, PathBuf};

/// Where a plugin comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallRequest {
    Remote { url: String, revision: Option<String> },
    Local { path: PathBuf },
}

impl InstallRequest {
    pub fn remote(url: impl Into<String>, revision: Option<String>) -> Self {
        InstallRequest::Remote {
            url: url.into(),
            revision: revision.filter(|r| !r.trim().is_empty()),
        }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        InstallRequest::Local { path: path.into() }
    }

    /// Recorded as the plugin's `source`.
    pub fn source(&self) -> String {
        match self {
            InstallRequest::Remote { url, .. } => url.clone(),
            InstallRequest::Local { path } => path.display().to_string(),
        }
    }

    /// What pip is asked to install.
    pub fn install_target(&self) -> String {
        match self {
            InstallRequest::Remote { url, revision: Some(rev) } => format!("git+{url}@{rev}"),
            InstallRequest::Remote { url, revision: None } => format!("git+{url}"),
            InstallRequest::Local { path } => path.display().to_string(),
        }
    }
}

pub struct ManifestReader<'a> {
    provisioner: &'a EnvironmentProvisioner,
}

impl<'a> ManifestReader<'a> {
    pub fn new(provisioner: &'a EnvironmentProvisioner) -> Self {
        Self { provisioner }
    }

    pub async fn read(&self, request: &InstallRequest) -> Result<PluginManifest, ManifestError> {
        match request {
            InstallRequest::Local { path } => Self::read_local(path),
            InstallRequest::Remote { url, revision } => {
                self.read_remote(url, revision.as_deref()).await
            }
        }
    }

    pub fn read_local(dir: &Path) -> Result<PluginManifest, ManifestError> {
        PluginManifest::from_file(&dir.join(MANIFEST_FILE))
    }

    async fn read_remote(
        &self,
        url: &str,
        revision: Option<&str>,
    ) -> Result<PluginManifest, ManifestError> {
        let vcs = self
            .provisioner
            .ensure_vcs_environment()
            .await
            .map_err(ManifestError::Vcs)?;
        let scratch = tempfile::Builder::new()
            .prefix("plugin-manifest-")
            .tempdir()
            .map_err(|source| ManifestError::Io {
                path: std::env::temp_dir(),
                source,
            })?;

        let result = self
            .fetch_manifest(&vcs, url, revision, &scratch.path().join("repo"))
            .await;

        let scratch_path = scratch.path().to_path_buf();
        if let Err(err) = scratch.close() {
            tracing::warn!(
                path = %scratch_path.display(),
                error = %err,
                "could not delete temporary clone"
            );
        }
        result
    }

    async fn fetch_manifest(
        &self,
        vcs: &Path,
        url: &str,
        revision: Option<&str>,
        clone_dir: &Path,
    ) -> Result<PluginManifest, ManifestError> {
        let git = || run_in_env(self.provisioner.manager(), vcs, ["git"]);
        let fetch_err = |source| ManifestError::Fetch {
            url: url.to_string(),
            source,
        };
        let runner = self.provisioner.runner();

        tracing::info!(url, revision, "fetching plugin manifest");
        let clone = git()
            .args(["clone", "--depth", "1", "--no-checkout", url])
            .arg(clone_dir);
        runner.run(&clone).await.map_err(fetch_err)?;

        let reference = match revision {
            Some(rev) => {
                let fetch = git()
                    .arg("-C")
                    .arg(clone_dir)
                    .args(["fetch", "--depth", "1", "origin", rev]);
                runner.run(&fetch).await.map_err(fetch_err)?;
                "FETCH_HEAD"
            }
            None => "HEAD",
        };
        let checkout = git()
            .arg("-C")
            .arg(clone_dir)
            .args(["checkout", reference, "--", MANIFEST_FILE]);
        runner.run(&checkout).await.map_err(fetch_err)?;

        PluginManifest::from_file(&clone_dir.join(MANIFEST_FILE))
    }
}
