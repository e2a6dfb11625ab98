//! Isolated per-plugin environments, created and removed with the
//! configured environment manager (micromamba by default).

use crate::error::ProvisionError;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use workbench_core::{CommandRunner, CommandSpec, EnvManagerConfig};

const VCS_ENV_DIR: &str = "_vcs";
const ENV_PREFIX: &str = "plugin_";

/// Prints `{"model_id", "model_title", "version"}` for the module named in argv[1].
const INTROSPECT_SCRIPT: &str = r#"
import importlib, json, sys
from importlib import metadata
name = sys.argv[1]
module = importlib.import_module(name)
spec = getattr(module, "MODEL_SPEC", None)
def attr(key):
    if isinstance(spec, dict):
        return spec.get(key)
    return getattr(spec, key, None)
try:
    version = metadata.version(name.split(".")[0])
except Exception:
    version = getattr(module, "__version__", None)
print(json.dumps({
    "model_id": attr("model_id"),
    "model_title": attr("model_title"),
    "version": version,
}))
"#;

static LAST_STAMP: AtomicI64 = AtomicI64::new(0);

/// Strictly increasing millisecond stamp, unique within this process.
fn next_stamp() -> i64 {
    let now = Utc::now().timestamp_millis();
    let prev = LAST_STAMP
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
        .unwrap_or(now);
    now.max(prev + 1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedEnvironment {
    pub prefix: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Identity reported by the installed package itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginIdentity {
    pub model_id: String,
    pub model_title: Option<String>,
    pub version: String,
}

#[derive(Debug, Deserialize)]
struct RawIdentity {
    model_id: Option<String>,
    model_title: Option<String>,
    version: Option<String>,
}

/// Called by [`EnvironmentProvisioner::provision`] as it moves between steps.
pub trait ProvisionObserver: Send + Sync {
    fn allocated(&self, _env: &ProvisionedEnvironment) {}
    fn installing(&self, _env: &ProvisionedEnvironment, _target: &str) {}
}

impl ProvisionObserver for () {}

/// `<manager> run --prefix PREFIX args...`
pub fn run_in_env<I, S>(manager: &EnvManagerConfig, prefix: &Path, args: I) -> CommandSpec
where
    I: IntoIterator<Item = S>,
    S: Into<std::ffi::OsString>,
{
    CommandSpec::new(&manager.executable)
        .arg("run")
        .arg("--prefix")
        .arg(prefix)
        .args(args)
}

pub struct EnvironmentProvisioner {
    runner: Arc<dyn CommandRunner>,
    manager: EnvManagerConfig,
    envs_dir: PathBuf,
}

impl EnvironmentProvisioner {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        manager: EnvManagerConfig,
        envs_dir: PathBuf,
    ) -> Self {
        Self {
            runner,
            manager,
            envs_dir,
        }
    }

    pub fn manager(&self) -> &EnvManagerConfig {
        &self.manager
    }

    pub fn envs_dir(&self) -> &Path {
        &self.envs_dir
    }

    pub fn vcs_prefix(&self) -> PathBuf {
        self.envs_dir.join(VCS_ENV_DIR)
    }

    pub(crate) fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    /// Shared environment holding only a git client. Created on first use;
    /// afterwards its directory is trusted as-is.
    pub async fn ensure_vcs_environment(&self) -> Result<PathBuf, ProvisionError> {
        let prefix = self.vcs_prefix();
        if prefix.is_dir() {
            return Ok(prefix);
        }
        tracing::info!(prefix = %prefix.display(), "creating shared git environment");
        let spec = CommandSpec::new(&self.manager.executable)
            .args(["create", "--yes", "--prefix"])
            .arg(&prefix)
            .args(["--override-channels", "-c"])
            .arg(&self.manager.channel)
            .arg("git");
        self.runner
            .run(&spec)
            .await
            .map_err(|source| ProvisionError::Create {
                prefix: prefix.clone(),
                source,
            })?;
        Ok(prefix)
    }

    /// Reserve a fresh prefix. The plugin's identity is unknown until its
    /// package is importable, so the name is time-based.
    pub fn allocate(&self) -> Result<ProvisionedEnvironment, ProvisionError> {
        std::fs::create_dir_all(&self.envs_dir).map_err(|source| ProvisionError::Io {
            path: self.envs_dir.clone(),
            source,
        })?;
        loop {
            let stamp = next_stamp();
            let prefix = self.envs_dir.join(format!("{ENV_PREFIX}{stamp}"));
            if prefix.exists() {
                continue;
            }
            let created_at = Utc
                .timestamp_millis_opt(stamp)
                .single()
                .unwrap_or_else(Utc::now);
            return Ok(ProvisionedEnvironment { prefix, created_at });
        }
    }

    /// Environment document: one trusted channel, no implicit defaults.
    pub fn environment_spec(&self, dependencies: &[String]) -> serde_json::Value {
        let mut packages = self.manager.base_packages.clone();
        packages.extend(dependencies.iter().cloned());
        serde_json::json!({
            "channels": [self.manager.channel, "nodefaults"],
            "dependencies": packages,
        })
    }

    pub async fn create(
        &self,
        env: &ProvisionedEnvironment,
        dependencies: &[String],
    ) -> Result<(), ProvisionError> {
        let io_err = |source| ProvisionError::Io {
            path: env.prefix.clone(),
            source,
        };
        // JSON is valid YAML, which is what the manager expects here.
        let mut spec_file = tempfile::Builder::new()
            .prefix("environment-")
            .suffix(".yml")
            .tempfile()
            .map_err(io_err)?;
        let document = serde_json::to_string_pretty(&self.environment_spec(dependencies))
            .map_err(|err| io_err(err.into()))?;
        spec_file.write_all(document.as_bytes()).map_err(io_err)?;
        spec_file.flush().map_err(io_err)?;

        tracing::info!(
            prefix = %env.prefix.display(),
            deps = ?dependencies,
            "creating plugin environment"
        );
        let spec = CommandSpec::new(&self.manager.executable)
            .args(["create", "--yes", "--prefix"])
            .arg(&env.prefix)
            .arg("--override-channels")
            .arg("--file")
            .arg(spec_file.path());
        self.runner
            .run(&spec)
            .await
            .map_err(|source| ProvisionError::Create {
                prefix: env.prefix.clone(),
                source,
            })?;
        Ok(())
    }

    /// Installs with the environment's own pip, after `create`.
    pub async fn install(
        &self,
        env: &ProvisionedEnvironment,
        target: &str,
    ) -> Result<(), ProvisionError> {
        tracing::info!(
            prefix = %env.prefix.display(),
            install_target = target,
            "installing plugin package"
        );
        let pip = ["python", "-m", "pip", "install", target];
        let spec = run_in_env(&self.manager, &env.prefix, pip);
        self.runner
            .run(&spec)
            .await
            .map_err(|source| ProvisionError::Install {
                prefix: env.prefix.clone(),
                target: target.to_string(),
                source,
            })?;
        Ok(())
    }

    /// Allocate, create and install in order.
    pub async fn provision(
        &self,
        dependencies: &[String],
        target: &str,
        observer: &dyn ProvisionObserver,
    ) -> Result<ProvisionedEnvironment, ProvisionError> {
        let env = self.allocate()?;
        observer.allocated(&env);
        self.create(&env, dependencies).await?;
        observer.installing(&env, target);
        self.install(&env, target).await?;
        Ok(env)
    }

    /// One structured call that imports the package and reports its identity.
    pub async fn resolve_identity(
        &self,
        prefix: &Path,
        package: &str,
    ) -> Result<PluginIdentity, ProvisionError> {
        let spec = run_in_env(&self.manager, prefix, ["python", "-c", INTROSPECT_SCRIPT, package]);
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|source| ProvisionError::Introspect {
                prefix: prefix.to_path_buf(),
                package: package.to_string(),
                source,
            })?;
        let identity_err = |detail: &str| ProvisionError::Identity {
            prefix: prefix.to_path_buf(),
            package: package.to_string(),
            detail: detail.to_string(),
        };

        let raw = output
            .stdout
            .iter()
            .rev()
            .find_map(|line| serde_json::from_str::<RawIdentity>(line.trim()).ok())
            .ok_or_else(|| identity_err("no JSON identity line in output"))?;
        let model_id = raw
            .model_id
            .filter(|v| !v.is_empty())
            .ok_or_else(|| identity_err("MODEL_SPEC.model_id is missing"))?;
        let version = raw
            .version
            .filter(|v| !v.is_empty())
            .ok_or_else(|| identity_err("package version is missing"))?;
        Ok(PluginIdentity {
            model_id,
            model_title: raw.model_title.filter(|v| !v.is_empty()),
            version,
        })
    }

    pub async fn teardown(&self, prefix: &Path) -> Result<(), ProvisionError> {
        if !prefix.exists() {
            return Err(ProvisionError::NotFound(prefix.to_path_buf()));
        }
        tracing::info!(prefix = %prefix.display(), "removing plugin environment");
        let spec = CommandSpec::new(&self.manager.executable)
            .args(["env", "remove", "--yes", "--prefix"])
            .arg(prefix);
        self.runner
            .run(&spec)
            .await
            .map_err(|source| ProvisionError::Remove {
                prefix: prefix.to_path_buf(),
                source,
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;
    use workbench_core::ProcessFailure;

    fn provisioner(runner: Arc<ScriptedRunner>, envs: &Path) -> EnvironmentProvisioner {
        EnvironmentProvisioner::new(runner, EnvManagerConfig::default(), envs.to_path_buf())
    }

    #[test]
    fn spec_lists_single_channel_and_merged_deps() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(Arc::new(ScriptedRunner::new()), dir.path());
        let spec = p.environment_spec(&["numpy".to_string(), "scipy".to_string()]);
        assert_eq!(
            spec,
            serde_json::json!({
                "channels": ["conda-forge", "nodefaults"],
                "dependencies": ["python", "git", "numpy", "scipy"],
            })
        );
    }

    #[test]
    fn allocated_prefixes_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(Arc::new(ScriptedRunner::new()), dir.path());
        let a = p.allocate().unwrap();
        let b = p.allocate().unwrap();
        assert_ne!(a.prefix, b.prefix);
        assert!(a.prefix.starts_with(dir.path()));
        assert!(b.created_at > a.created_at);
    }

    #[tokio::test]
    async fn provision_runs_create_then_pip() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let p = provisioner(runner.clone(), dir.path());
        let env = p
            .provision(&["numpy".to_string()], "git+https://example.com/plug.git", &())
            .await
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with(&format!(
            "micromamba create --yes --prefix {} --override-channels --file ",
            env.prefix.display()
        )));
        assert_eq!(
            calls[1],
            format!(
                "micromamba run --prefix {} python -m pip install git+https://example.com/plug.git",
                env.prefix.display()
            )
        );
    }

    #[tokio::test]
    async fn identity_is_read_from_last_json_line() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(
            "python -c",
            Ok(vec![
                "warning: something noisy".to_string(),
                r#"{"model_id": "carbon_plugin", "model_title": "Carbon", "version": "2.0.1"}"#
                    .to_string(),
            ]),
        );
        let p = provisioner(runner.clone(), dir.path());
        let identity = p.resolve_identity(dir.path(), "carbon_plugin").await.unwrap();
        assert_eq!(
            identity,
            PluginIdentity {
                model_id: "carbon_plugin".to_string(),
                model_title: Some("Carbon".to_string()),
                version: "2.0.1".to_string(),
            }
        );
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn identity_without_version_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("python -c", Ok(vec![r#"{"model_id": "x", "version": null}"#.to_string()]));
        let p = provisioner(runner, dir.path());
        let err = p.resolve_identity(dir.path(), "x").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Identity { .. }));
    }

    #[tokio::test]
    async fn teardown_of_missing_prefix_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let p = provisioner(runner.clone(), dir.path());
        let err = p.teardown(&dir.path().join("gone")).await.unwrap_err();
        assert!(matches!(err, ProvisionError::NotFound(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn teardown_failure_carries_tool_output() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(
            "env remove",
            Err(ProcessFailure::Exit {
                program: "micromamba".to_string(),
                code: Some(1),
                stderr: "locked".to_string(),
            }),
        );
        let p = provisioner(runner, dir.path());
        let err = p.teardown(dir.path()).await.unwrap_err();
        match err {
            ProvisionError::Remove { source, .. } => assert_eq!(source.stderr(), Some("locked")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn vcs_environment_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let p = provisioner(runner.clone(), dir.path());

        let prefix = p.ensure_vcs_environment().await.unwrap();
        assert_eq!(runner.calls().len(), 1);
        assert!(runner.calls()[0].ends_with("--override-channels -c conda-forge git"));

        std::fs::create_dir_all(&prefix).unwrap();
        p.ensure_vcs_environment().await.unwrap();
        assert_eq!(runner.calls().len(), 1);
    }
}
