//! Add/remove sequencing for plugins.
//!
//! Adding walks `ResolvingManifest → Provisioning → Installing →
//! ResolvingIdentity → Registering → Done`, strictly in order; the first
//! failure ends the sequence. A failed add does not roll back its
//! environment. The prefix is left in the journal for [`PluginInstaller::cleanup_orphans`].
//! Removing purges the registry record even when the environment cannot be
//! torn down.

use crate::bus::{ProgressEvent, ProgressSink};
use crate::error::{
    InstallError, ProvisionError, RegistryError, RemoveError, SetupError, StageError,
};
use crate::journal::{EnvJournal, PendingEnv};
use crate::locks::KeyedLocks;
use crate::provision::{EnvironmentProvisioner, ProvisionObserver, ProvisionedEnvironment};
use crate::reader::{InstallRequest, ManifestReader};
use crate::registry::{PluginKey, PluginRecord, PluginRegistry, RecordKind};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use workbench_core::{format_error_chain, CommandRunner, CoreConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ResolvingManifest,
    Provisioning,
    Installing,
    ResolvingIdentity,
    Registering,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::ResolvingManifest => "resolving manifest",
            Stage::Provisioning => "provisioning environment",
            Stage::Installing => "installing package",
            Stage::ResolvingIdentity => "resolving plugin identity",
            Stage::Registering => "registering plugin",
            Stage::Done => "done",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub key: PluginKey,
    /// False when nothing was registered under the key.
    pub existed: bool,
    /// Logged and swallowed; the record is purged regardless.
    pub teardown_error: Option<String>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    /// Still being installed by this process.
    pub skipped: Vec<PathBuf>,
}

fn notify(progress: &dyn ProgressSink, stage: Stage, message: String) {
    tracing::info!(%stage, "{message}");
    let event = ProgressEvent { stage, message };
    if std::panic::catch_unwind(AssertUnwindSafe(|| progress.emit(event))).is_err() {
        tracing::warn!(%stage, "progress sink panicked; continuing");
    }
}

struct AddObserver<'a> {
    installer: &'a PluginInstaller,
    progress: &'a dyn ProgressSink,
    source: &'a str,
    allocated: Mutex<Option<PathBuf>>,
}

impl ProvisionObserver for AddObserver<'_> {
    fn allocated(&self, env: &ProvisionedEnvironment) {
        *self.allocated.lock().unwrap_or_else(PoisonError::into_inner) = Some(env.prefix.clone());
        self.installer.in_flight().insert(env.prefix.clone());
        self.installer.journal_record(PendingEnv {
            prefix: env.prefix.clone(),
            source: self.source.to_string(),
            created_at: env.created_at,
        });
        tracing::info!(prefix = %env.prefix.display(), "allocated plugin environment");
    }

    fn installing(&self, _env: &ProvisionedEnvironment, target: &str) {
        notify(self.progress, Stage::Installing, format!("Installing {target}"));
    }
}

pub struct PluginInstaller {
    provisioner: EnvironmentProvisioner,
    registry: Mutex<PluginRegistry>,
    journal: Mutex<EnvJournal>,
    locks: KeyedLocks,
    in_flight: Mutex<HashSet<PathBuf>>,
}

impl PluginInstaller {
    pub fn new(
        provisioner: EnvironmentProvisioner,
        registry: PluginRegistry,
        journal: EnvJournal,
    ) -> Self {
        Self {
            provisioner,
            registry: Mutex::new(registry),
            journal: Mutex::new(journal),
            locks: KeyedLocks::new(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Opens the registry and journal named by `cfg`.
    pub fn from_config(
        cfg: &CoreConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, SetupError> {
        let provisioner =
            EnvironmentProvisioner::new(runner, cfg.env_manager.clone(), cfg.envs_dir()?);
        let registry = PluginRegistry::open(cfg.settings_file()?)?;
        let journal = EnvJournal::open(cfg.journal_file()?)?;
        Ok(Self::new(provisioner, registry, journal))
    }

    fn registry(&self) -> MutexGuard<'_, PluginRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn journal(&self) -> MutexGuard<'_, EnvJournal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn journal_record(&self, entry: PendingEnv) {
        let prefix = entry.prefix.clone();
        if let Err(err) = self.journal().record(entry) {
            tracing::warn!(
                prefix = %prefix.display(),
                error = %format_error_chain(&err),
                "could not journal environment"
            );
        }
    }

    fn journal_clear(&self, prefix: &Path) {
        if let Err(err) = self.journal().clear(prefix) {
            tracing::warn!(
                prefix = %prefix.display(),
                error = %format_error_chain(&err),
                "could not update environment journal"
            );
        }
    }

    pub fn lookup(&self, identity: &str) -> Option<PluginRecord> {
        self.registry().lookup(&PluginKey::from_identity(identity))
    }

    pub fn list(&self) -> Vec<(PluginKey, PluginRecord)> {
        self.registry().list()
    }

    pub fn pending_environments(&self) -> Vec<PendingEnv> {
        self.journal().list().to_vec()
    }

    pub async fn add_plugin(
        &self,
        request: &InstallRequest,
        progress: &dyn ProgressSink,
    ) -> Result<PluginRecord, InstallError> {
        let source = request.source();
        let _source_guard = self.locks.acquire(&format!("source:{source}")).await;

        let result = self.add_locked(request, &source, progress).await;
        match &result {
            Ok(record) => tracing::info!(
                plugin_id = %record.key(),
                env = %record.env.display(),
                "plugin installed"
            ),
            Err(err) => tracing::error!(
                stage = %err.stage,
                orphan = ?err.orphan,
                error = %format_error_chain(err),
                "plugin install failed"
            ),
        }
        result
    }

    async fn add_locked(
        &self,
        request: &InstallRequest,
        source: &str,
        progress: &dyn ProgressSink,
    ) -> Result<PluginRecord, InstallError> {
        notify(
            progress,
            Stage::ResolvingManifest,
            format!("Reading plugin manifest from {source}"),
        );
        let manifest = ManifestReader::new(&self.provisioner)
            .read(request)
            .await
            .map_err(|err| InstallError::new(Stage::ResolvingManifest, err))?;
        tracing::info!(
            model_id = %manifest.model_id,
            package = %manifest.package_name,
            "manifest resolved"
        );

        let observer = AddObserver {
            installer: self,
            progress,
            source,
            allocated: Mutex::new(None),
        };
        let target = request.install_target();
        let result = self
            .install_and_register(&observer, &manifest, &target, source, progress)
            .await;

        let allocated = observer
            .allocated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(prefix) = &allocated {
            self.in_flight().remove(prefix);
        }
        result.map_err(|(stage, err)| {
            let failure = InstallError::new(stage, err);
            match allocated {
                Some(prefix) => {
                    tracing::warn!(
                        prefix = %prefix.display(),
                        "environment left on disk without a registry record; `cleanup` removes it"
                    );
                    failure.with_orphan(prefix)
                }
                None => failure,
            }
        })
    }

    async fn install_and_register(
        &self,
        observer: &AddObserver<'_>,
        manifest: &crate::manifest::PluginManifest,
        target: &str,
        source: &str,
        progress: &dyn ProgressSink,
    ) -> Result<PluginRecord, (Stage, StageError)> {
        notify(
            progress,
            Stage::Provisioning,
            format!("Creating environment for {}", manifest.model_title),
        );
        let env = self
            .provisioner
            .provision(&manifest.conda_dependencies, target, observer)
            .await
            .map_err(|err| {
                let stage = match err {
                    ProvisionError::Install { .. } => Stage::Installing,
                    _ => Stage::Provisioning,
                };
                (stage, err.into())
            })?;

        notify(
            progress,
            Stage::ResolvingIdentity,
            format!("Resolving identity of {}", manifest.package_name),
        );
        let identity = self
            .provisioner
            .resolve_identity(&env.prefix, &manifest.package_name)
            .await
            .map_err(|err| (Stage::ResolvingIdentity, err.into()))?;

        let key = PluginKey::new(&identity.model_id, &identity.version);
        notify(progress, Stage::Registering, format!("Registering {key}"));
        let record = PluginRecord {
            model_id: identity.model_id,
            model_title: identity
                .model_title
                .unwrap_or_else(|| manifest.model_title.clone()),
            kind: RecordKind::Plugin,
            source: source.to_string(),
            env: env.prefix.clone(),
            version: identity.version,
            notebook_path: manifest.notebook_path.clone(),
        };

        let _identity_guard = self.locks.acquire(&format!("plugin:{key}")).await;
        let replaced = self
            .registry()
            .upsert(key.clone(), record.clone())
            .map_err(|err| (Stage::Registering, err.into()))?;
        self.journal_clear(&env.prefix);
        if let Some(previous) = replaced.filter(|prev| prev.env != record.env) {
            tracing::warn!(
                plugin_id = %key,
                prefix = %previous.env.display(),
                "replaced registration; previous environment queued for cleanup"
            );
            self.journal_record(PendingEnv {
                prefix: previous.env,
                source: previous.source,
                created_at: Utc::now(),
            });
        }

        notify(
            progress,
            Stage::Done,
            format!("Installed {} {}", record.model_title, record.version),
        );
        Ok(record)
    }

    pub async fn remove_plugin(&self, identity: &str) -> Result<RemoveOutcome, RemoveError> {
        let key = PluginKey::from_identity(identity);
        let _guard = self.locks.acquire(&format!("plugin:{key}")).await;

        let record = self.registry().lookup(&key);
        let Some(record) = record else {
            tracing::info!(plugin_id = %key, "plugin not registered; nothing to remove");
            return Ok(RemoveOutcome {
                key,
                existed: false,
                teardown_error: None,
            });
        };

        let teardown = self.provisioner.teardown(&record.env).await;
        let teardown_error = match teardown {
            Ok(()) => None,
            Err(err) => {
                let chain = format_error_chain(&err);
                tracing::warn!(
                    plugin_id = %key,
                    error = %chain,
                    "environment teardown failed; unregistering anyway"
                );
                if !matches!(err, ProvisionError::NotFound(_)) {
                    self.journal_record(PendingEnv {
                        prefix: record.env.clone(),
                        source: record.source.clone(),
                        created_at: Utc::now(),
                    });
                }
                Some(chain)
            }
        };

        self.registry().remove(&key).map_err(|source| RemoveError {
            key: key.to_string(),
            source,
        })?;
        if teardown_error.is_none() {
            self.journal_clear(&record.env);
        }
        tracing::info!(plugin_id = %key, "plugin removed");
        Ok(RemoveOutcome {
            key,
            existed: true,
            teardown_error,
        })
    }

    /// Tear down journalled environments that no record owns.
    pub async fn cleanup_orphans(&self) -> Result<CleanupReport, RegistryError> {
        let entries = self.pending_environments();
        let mut report = CleanupReport::default();

        for entry in entries {
            let prefix = entry.prefix;
            if self.in_flight().contains(&prefix) {
                report.skipped.push(prefix);
                continue;
            }
            let owned = self.registry().references_env(&prefix);
            if owned {
                self.journal().clear(&prefix)?;
                continue;
            }
            let teardown = self.provisioner.teardown(&prefix).await;
            match teardown {
                Ok(()) | Err(ProvisionError::NotFound(_)) => {
                    self.journal().clear(&prefix)?;
                    report.removed.push(prefix);
                }
                Err(err) => {
                    let chain = format_error_chain(&err);
                    tracing::warn!(
                        prefix = %prefix.display(),
                        error = %chain,
                        "orphan cleanup failed"
                    );
                    report.failed.push((prefix, chain));
                }
            }
        }
        Ok(report)
    }

    pub fn close(self) -> Result<(), RegistryError> {
        self.registry
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChannelSink;
    use crate::manifest::MANIFEST_FILE;
    use crate::testing::{arg_after, failure, ScriptedRunner};
    use tempfile::TempDir;
    use workbench_core::EnvManagerConfig;

    const MANIFEST: &str = r#"
[tool.natcap.invest]
model_id = "carbon_plugin"
model_title = "Carbon"
package_name = "carbon_plugin"
conda_dependencies = ["numpy", "scipy"]
notebook_path = "demo.ipynb"
"#;

    const IDENTITY: &str =
        r#"{"model_id": "carbon_plugin", "model_title": "Carbon Storage", "version": "2.0.1"}"#;

    struct Fixture {
        dir: TempDir,
        runner: Arc<ScriptedRunner>,
        installer: PluginInstaller,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::with_fs_effects());
        runner.on(" checkout ", |spec| {
            if let Some(clone) = arg_after(spec, "-C") {
                std::fs::create_dir_all(&clone).unwrap();
                std::fs::write(clone.join(MANIFEST_FILE), MANIFEST).unwrap();
            }
        });
        let installer = installer_in(&dir, runner.clone());
        Fixture { dir, runner, installer }
    }

    fn installer_in(dir: &TempDir, runner: Arc<ScriptedRunner>) -> PluginInstaller {
        let provisioner = EnvironmentProvisioner::new(
            runner,
            EnvManagerConfig::default(),
            dir.path().join("envs"),
        );
        PluginInstaller::new(
            provisioner,
            PluginRegistry::open(dir.path().join("settings.json")).unwrap(),
            EnvJournal::open(dir.path().join("pending-envs.json")).unwrap(),
        )
    }

    fn stages(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<Stage> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event.stage);
        }
        out
    }

    #[tokio::test]
    async fn remote_add_registers_version_qualified_identity() {
        let fx = fixture();
        let env_spec = Arc::new(Mutex::new(None));
        let seen = env_spec.clone();
        fx.runner.on("--file", move |spec| {
            let file = arg_after(spec, "--file").unwrap();
            *seen.lock().unwrap() = Some(std::fs::read_to_string(file).unwrap());
        });
        fx.runner.respond("python -c", Ok(vec![IDENTITY.to_string()]));
        let (sink, mut rx) = ChannelSink::new();

        let request =
            InstallRequest::remote("https://example.com/plug.git", Some("v2.0".to_string()));
        let record = fx.installer.add_plugin(&request, &sink).await.unwrap();

        assert_eq!(record.key().as_str(), "carbon_plugin@2_0_1");
        assert_eq!(record.version, "2.0.1");
        assert_eq!(record.model_title, "Carbon Storage");
        assert_eq!(record.source, "https://example.com/plug.git");
        assert_eq!(record.notebook_path.as_deref(), Some("demo.ipynb"));
        assert!(record.env.starts_with(fx.dir.path().join("envs")));

        let reopened = PluginRegistry::open(fx.dir.path().join("settings.json")).unwrap();
        assert_eq!(reopened.list(), vec![(record.key(), record.clone())]);

        let calls = fx.runner.calls();
        assert!(calls.iter().any(|c| c.contains(" fetch --depth 1 origin v2.0")));
        assert!(calls.iter().any(|c| c.ends_with("checkout FETCH_HEAD -- pyproject.toml")));
        assert!(calls
            .iter()
            .any(|c| c.ends_with("python -m pip install git+https://example.com/plug.git@v2.0")));
        assert_eq!(fx.runner.count("python -c"), 1);

        let document: serde_json::Value =
            serde_json::from_str(env_spec.lock().unwrap().as_deref().unwrap()).unwrap();
        assert_eq!(document["channels"], serde_json::json!(["conda-forge", "nodefaults"]));
        assert_eq!(
            document["dependencies"],
            serde_json::json!(["python", "git", "numpy", "scipy"])
        );

        assert_eq!(
            stages(&mut rx),
            vec![
                Stage::ResolvingManifest,
                Stage::Provisioning,
                Stage::Installing,
                Stage::ResolvingIdentity,
                Stage::Registering,
                Stage::Done,
            ]
        );
        assert!(fx.installer.pending_environments().is_empty());
    }

    #[tokio::test]
    async fn missing_local_manifest_fails_without_processes() {
        let fx = fixture();
        let plugin = tempfile::tempdir().unwrap();
        let (sink, mut rx) = ChannelSink::new();

        let err = fx
            .installer
            .add_plugin(&InstallRequest::local(plugin.path()), &sink)
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::ResolvingManifest);
        assert!(matches!(err.source, StageError::Manifest(_)));
        assert_eq!(err.orphan, None);
        assert!(fx.runner.calls().is_empty());
        assert_eq!(stages(&mut rx), vec![Stage::ResolvingManifest]);
        assert!(fx.installer.list().is_empty());
    }

    #[tokio::test]
    async fn unparseable_manifest_never_provisions() {
        let fx = fixture();
        let plugin = tempfile::tempdir().unwrap();
        std::fs::write(
            plugin.path().join(MANIFEST_FILE),
            "[tool.natcap.invest]\nmodel_title = \"No id\"\n",
        )
        .unwrap();

        let err = fx
            .installer
            .add_plugin(&InstallRequest::local(plugin.path()), &crate::bus::NullSink)
            .await
            .unwrap_err();
        assert!(matches!(err.source, StageError::Manifest(_)));
        assert_eq!(fx.runner.count(" create "), 0);
        assert!(!fx.dir.path().join("envs").exists());
    }

    #[tokio::test]
    async fn install_failure_leaves_journalled_orphan_that_cleanup_removes() {
        let fx = fixture();
        let plugin = tempfile::tempdir().unwrap();
        std::fs::write(plugin.path().join(MANIFEST_FILE), MANIFEST).unwrap();
        fx.runner
            .respond("pip install", Err(failure("ERROR: No matching distribution found")));

        let err = fx
            .installer
            .add_plugin(&InstallRequest::local(plugin.path()), &crate::bus::NullSink)
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::Installing);
        assert!(format_error_chain(&err).contains("No matching distribution found"));
        let orphan = err.orphan.clone().unwrap();
        assert!(orphan.exists());
        assert!(fx.installer.list().is_empty());
        assert_eq!(fx.installer.pending_environments().len(), 1);

        let report = fx.installer.cleanup_orphans().await.unwrap();
        assert_eq!(report.removed, vec![orphan.clone()]);
        assert!(report.failed.is_empty());
        assert!(!orphan.exists());
        assert!(fx.installer.pending_environments().is_empty());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let fx = fixture();
        fx.runner.respond("python -c", Ok(vec![IDENTITY.to_string()]));
        let request = InstallRequest::remote("https://example.com/plug.git", None);
        let record = fx.installer.add_plugin(&request, &crate::bus::NullSink).await.unwrap();

        let first = fx.installer.remove_plugin("carbon_plugin@2.0.1").await.unwrap();
        assert!(first.existed);
        assert_eq!(first.teardown_error, None);
        assert!(!record.env.exists());

        let second = fx.installer.remove_plugin("carbon_plugin@2.0.1").await.unwrap();
        assert!(!second.existed);
        assert!(fx.installer.lookup("carbon_plugin@2_0_1").is_none());
    }

    #[tokio::test]
    async fn teardown_failure_still_purges_record() {
        let fx = fixture();
        fx.runner.respond("python -c", Ok(vec![IDENTITY.to_string()]));
        let request = InstallRequest::remote("https://example.com/plug.git", None);
        let record = fx.installer.add_plugin(&request, &crate::bus::NullSink).await.unwrap();
        fx.runner.respond(" env remove ", Err(failure("environment is in use")));

        let outcome = fx.installer.remove_plugin(record.key().as_str()).await.unwrap();
        assert!(outcome.existed);
        assert!(outcome.teardown_error.unwrap().contains("environment is in use"));
        assert!(fx.installer.lookup(record.key().as_str()).is_none());
        assert!(PluginRegistry::open(fx.dir.path().join("settings.json"))
            .unwrap()
            .lookup(&record.key())
            .is_none());
        assert_eq!(fx.installer.pending_environments()[0].prefix, record.env);
    }

    #[tokio::test]
    async fn reinstall_replaces_record_and_queues_old_env() {
        let fx = fixture();
        let request = InstallRequest::remote("https://example.com/plug.git", None);
        fx.runner.respond("python -c", Ok(vec![IDENTITY.to_string()]));
        let first = fx.installer.add_plugin(&request, &crate::bus::NullSink).await.unwrap();
        fx.runner.respond("python -c", Ok(vec![IDENTITY.to_string()]));
        let second = fx.installer.add_plugin(&request, &crate::bus::NullSink).await.unwrap();

        assert_ne!(first.env, second.env);
        assert_eq!(fx.installer.list().len(), 1);
        let pending = fx.installer.pending_environments();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].prefix, first.env);
    }

    #[tokio::test]
    async fn panicking_progress_sink_does_not_abort() {
        let fx = fixture();
        fx.runner.respond("python -c", Ok(vec![IDENTITY.to_string()]));
        let sink = |event: ProgressEvent| {
            if event.stage == Stage::Provisioning {
                panic!("ui went away");
            }
        };
        let request = InstallRequest::remote("https://example.com/plug.git", None);
        assert!(fx.installer.add_plugin(&request, &sink).await.is_ok());
    }

    #[tokio::test]
    async fn uncreatable_envs_dir_still_announces_provisioning() {
        let fx = fixture();
        std::fs::write(fx.dir.path().join("envs"), "not a directory").unwrap();
        let plugin = tempfile::tempdir().unwrap();
        std::fs::write(plugin.path().join(MANIFEST_FILE), MANIFEST).unwrap();
        let (sink, mut rx) = ChannelSink::new();

        let err = fx
            .installer
            .add_plugin(&InstallRequest::local(plugin.path()), &sink)
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::Provisioning);
        assert_eq!(err.orphan, None);
        assert_eq!(
            stages(&mut rx),
            vec![Stage::ResolvingManifest, Stage::Provisioning]
        );
        assert!(fx.runner.calls().is_empty());
    }

    fn plugin_envs(fx: &Fixture) -> Vec<PathBuf> {
        let mut envs: Vec<PathBuf> = std::fs::read_dir(fx.dir.path().join("envs"))
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| {
                path.file_name()
                    .is_some_and(|name| name.to_string_lossy().starts_with("plugin_"))
            })
            .collect();
        envs.sort();
        envs
    }

    #[tokio::test]
    async fn concurrent_adds_of_one_source_run_one_at_a_time() {
        let fx = fixture();
        let plugin = tempfile::tempdir().unwrap();
        std::fs::write(plugin.path().join(MANIFEST_FILE), MANIFEST).unwrap();
        fx.runner.respond("python -c", Ok(vec![IDENTITY.to_string()]));
        fx.runner.respond("python -c", Ok(vec![IDENTITY.to_string()]));
        let request = InstallRequest::local(plugin.path());

        let (first, second) = tokio::join!(
            fx.installer.add_plugin(&request, &crate::bus::NullSink),
            fx.installer.add_plugin(&request, &crate::bus::NullSink),
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_ne!(first.env, second.env);

        let steps: Vec<&str> = fx
            .runner
            .calls()
            .iter()
            .map(|call| {
                if call.contains(" create ") {
                    "create"
                } else if call.contains("pip install") {
                    "install"
                } else {
                    "identity"
                }
            })
            .collect();
        assert_eq!(
            steps,
            vec!["create", "install", "identity", "create", "install", "identity"]
        );

        let records = fx.installer.list();
        assert_eq!(records.len(), 1);
        let winner = &records[0].1;
        let loser = if winner.env == first.env { &second } else { &first };
        let pending: Vec<PathBuf> = fx
            .installer
            .pending_environments()
            .into_iter()
            .map(|entry| entry.prefix)
            .collect();
        assert_eq!(pending, vec![loser.env.clone()]);
    }

    #[tokio::test]
    async fn concurrent_add_and_remove_leave_no_untracked_env() {
        let fx = fixture();
        let plugin = tempfile::tempdir().unwrap();
        std::fs::write(plugin.path().join(MANIFEST_FILE), MANIFEST).unwrap();
        let request = InstallRequest::local(plugin.path());
        fx.runner.respond("python -c", Ok(vec![IDENTITY.to_string()]));
        fx.installer
            .add_plugin(&request, &crate::bus::NullSink)
            .await
            .unwrap();
        fx.runner.respond("python -c", Ok(vec![IDENTITY.to_string()]));

        let (added, removed) = tokio::join!(
            fx.installer.add_plugin(&request, &crate::bus::NullSink),
            fx.installer.remove_plugin("carbon_plugin@2.0.1"),
        );
        added.unwrap();
        assert!(removed.unwrap().existed);

        let records = fx.installer.list();
        assert!(records.len() <= 1);
        let pending: Vec<PathBuf> = fx
            .installer
            .pending_environments()
            .into_iter()
            .map(|entry| entry.prefix)
            .collect();
        for env in plugin_envs(&fx) {
            let owned = records.iter().any(|(_, record)| record.env == env);
            assert!(
                owned || pending.contains(&env),
                "{} has neither a record nor a journal entry",
                env.display()
            );
        }
        for (_, record) in &records {
            assert!(record.env.exists());
        }
    }

    #[tokio::test]
    async fn identity_failure_reports_stage_and_orphan() {
        let fx = fixture();
        fx.runner.respond(
            "python -c",
            Err(failure("ModuleNotFoundError: No module named 'carbon_plugin'")),
        );
        let request = InstallRequest::remote("https://example.com/plug.git", None);
        let err = fx.installer.add_plugin(&request, &crate::bus::NullSink).await.unwrap_err();
        assert_eq!(err.stage, Stage::ResolvingIdentity);
        assert!(err.orphan.is_some());
        assert!(fx.installer.list().is_empty());
    }
}
