use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use workbench_core::{CancelHandle, CoreConfig, ProcessManager, ProcessRunner};
use workbench_plugins::{InstallRequest, NotebookLauncher, PluginInstaller, ProgressEvent};

#[derive(Parser)]
#[command(name = "workbench", version, about = "Install, list and remove model plugins")]
struct Cli {
    /// Config file (TOML). Defaults to the platform config dir.
    #[arg(long, global = true, env = "WORKBENCH_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Install a plugin from a git repository or a local directory.
    Add(AddArgs),
    /// Unregister a plugin and remove its environment.
    Remove { id: String },
    List,
    Show { id: String },
    /// Remove environments left behind by failed or replaced installs.
    Cleanup,
    /// Run a plugin's notebook server until interrupted.
    Notebook { id: String },
}

#[derive(Args)]
#[command(group(ArgGroup::new("source").required(true).args(["url", "path"])))]
struct AddArgs {
    #[arg(long)]
    url: Option<String>,
    /// Branch, tag or commit; only with --url.
    #[arg(long, requires = "url", conflicts_with = "path")]
    rev: Option<String>,
    #[arg(long)]
    path: Option<PathBuf>,
}

impl AddArgs {
    fn request(self) -> Result<InstallRequest> {
        match (self.url, self.path) {
            (Some(url), None) => Ok(InstallRequest::remote(url, self.rev)),
            (None, Some(_)) if self.rev.is_some() => bail!("--rev only applies to --url"),
            (None, Some(path)) => {
                let path = std::fs::canonicalize(&path)
                    .with_context(|| format!("plugin directory {} not found", path.display()))?;
                Ok(InstallRequest::local(path))
            }
            _ => bail!("pass exactly one of --url or --path"),
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<CoreConfig> {
    let Some(path) = path.or_else(CoreConfig::default_config_file) else {
        return Ok(CoreConfig::default());
    };
    CoreConfig::load_or_default(&path).with_context(|| format!("loading {}", path.display()))
}

fn open_installer(cfg: &CoreConfig) -> Result<PluginInstaller> {
    let cancel = CancelHandle::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; stopping the running external command");
            on_interrupt.cancel();
        }
    });
    let runner = ProcessRunner::from_config(&cfg.process).with_cancel(cancel);
    PluginInstaller::from_config(cfg, Arc::new(runner)).context("opening plugin registry")
}

fn print_progress(event: ProgressEvent) {
    eprintln!("[{}] {}", event.stage, event.message);
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = load_config(cli.config)?;

    match cli.command {
        Command::Add(args) => {
            let request = args.request()?;
            let installer = open_installer(&cfg)?;
            let record = installer.add_plugin(&request, &print_progress).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            installer.close()?;
        }
        Command::Remove { id } => {
            let installer = open_installer(&cfg)?;
            let outcome = installer.remove_plugin(&id).await?;
            if !outcome.existed {
                println!("{} was not registered", outcome.key);
            } else {
                if let Some(err) = &outcome.teardown_error {
                    eprintln!("warning: environment not removed: {err}");
                }
                println!("removed {}", outcome.key);
            }
            installer.close()?;
        }
        Command::List => {
            let installer = open_installer(&cfg)?;
            for (key, record) in installer.list() {
                println!("{key}\t{}\t{}", record.model_title, record.env.display());
            }
        }
        Command::Show { id } => {
            let installer = open_installer(&cfg)?;
            let Some(record) = installer.lookup(&id) else {
                bail!("no plugin registered as {id}");
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Cleanup => {
            let installer = open_installer(&cfg)?;
            let report = installer.cleanup_orphans().await?;
            for prefix in &report.removed {
                println!("removed {}", prefix.display());
            }
            for prefix in &report.skipped {
                println!("skipped {} (install in progress)", prefix.display());
            }
            for (prefix, err) in &report.failed {
                eprintln!("failed {}: {err}", prefix.display());
            }
            if !report.failed.is_empty() {
                bail!("{} environment(s) could not be removed", report.failed.len());
            }
        }
        Command::Notebook { id } => {
            let installer = open_installer(&cfg)?;
            let Some(record) = installer.lookup(&id) else {
                bail!("no plugin registered as {id}");
            };
            let launcher = NotebookLauncher::new(
                ProcessManager::new(),
                cfg.env_manager.clone(),
                cfg.notebook.clone(),
            );
            let handle = launcher.launch(&record)?;
            eprintln!(
                "notebook server for {} at {} (Ctrl-C to stop)",
                record.model_title,
                launcher.url()
            );
            while launcher.is_running(&handle) {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
            launcher.stop(&handle)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    workbench_core::logging::init_logging();
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:?}");
            ExitCode::FAILURE
        }
    }
}
