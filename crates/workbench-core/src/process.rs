use crate::config::ProcessConfig;
use crate::error::{CoreResult, ProcessFailure};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Child, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;

/// Lines of stderr kept for the failure message.
const STDERR_TAIL: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// `program arg1 arg2 ...`, for logs and test assertions.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub code: i32,
    pub stdout: Vec<String>,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. Exit code 0 is the only success.
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, ProcessFailure>;
}

/// Shared cancel switch; cancelling kills whatever child is live.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

async fn cancelled(rx: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = rx else {
        return std::future::pending().await;
    };
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

async fn expired(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Log every line as it arrives and keep the last `keep` of them.
async fn forward_lines<R>(
    reader: Option<R>,
    program: String,
    stream: Stream,
    keep: usize,
) -> VecDeque<String>
where
    R: AsyncRead + Unpin,
{
    let mut kept = VecDeque::new();
    let Some(reader) = reader else {
        return kept;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                match stream {
                    Stream::Stdout => {
                        tracing::info!(target: "workbench::process", program = %program, "{line}")
                    }
                    Stream::Stderr => {
                        tracing::warn!(target: "workbench::process", program = %program, "{line}")
                    }
                }
                if kept.len() == keep {
                    kept.pop_front();
                }
                kept.push_back(line);
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(
                    program = %program,
                    ?stream,
                    error = %err,
                    "stopped reading child output"
                );
                break;
            }
        }
    }
    kept
}

/// Runs external tools with `tokio::process`, one at a time per call.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
    cancel: Option<CancelHandle>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &ProcessConfig) -> Self {
        Self::new().with_timeout(cfg.timeout())
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Why a run ended before the child and its output pipes were done.
#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Timeout,
    Cancelled,
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, ProcessFailure> {
        let program = spec.program.clone();
        if self.cancel.as_ref().is_some_and(CancelHandle::is_cancelled) {
            return Err(ProcessFailure::Cancelled { program });
        }

        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        tracing::info!(command = %spec.display(), "running external command");
        let mut child = cmd.spawn().map_err(|source| ProcessFailure::Spawn {
            program: program.clone(),
            source,
        })?;

        let mut stdout_task = tokio::spawn(forward_lines(
            child.stdout.take(),
            program.clone(),
            Stream::Stdout,
            usize::MAX,
        ));
        let mut stderr_task = tokio::spawn(forward_lines(
            child.stderr.take(),
            program.clone(),
            Stream::Stderr,
            STDERR_TAIL,
        ));

        // The deadline covers the drained pipes too: a grandchild holding
        // them open must not outlive the timeout.
        let cancel_rx = self.cancel.as_ref().map(CancelHandle::subscribe);
        let outcome = {
            let finish = async {
                let status = child.wait().await;
                let stdout = (&mut stdout_task).await.unwrap_or_default();
                let stderr = (&mut stderr_task).await.unwrap_or_default();
                (status, stdout, stderr)
            };
            tokio::select! {
                done = finish => Ok(done),
                _ = expired(self.timeout) => Err(Interrupt::Timeout),
                _ = cancelled(cancel_rx) => Err(Interrupt::Cancelled),
            }
        };

        let (status, stdout, stderr) = match outcome {
            Ok(done) => done,
            Err(interrupt) => {
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                tracing::warn!(program = %program, ?interrupt, "external command interrupted");
                return Err(match interrupt {
                    Interrupt::Timeout => ProcessFailure::Timeout {
                        program,
                        after: self.timeout.unwrap_or_default(),
                    },
                    Interrupt::Cancelled => ProcessFailure::Cancelled { program },
                });
            }
        };
        let status = status.map_err(|source| ProcessFailure::Spawn {
            program: program.clone(),
            source,
        })?;

        if status.success() {
            return Ok(ProcessOutput {
                code: 0,
                stdout: stdout.into(),
            });
        }
        Err(ProcessFailure::Exit {
            program,
            code: status.code(),
            stderr: Vec::from(stderr).join("\n"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub id: u64,
    pub pid: u32,
}

/// Owns long-lived children such as a notebook server.
#[derive(Clone, Default)]
pub struct ProcessManager {
    inner: Arc<Mutex<ProcessState>>,
}

#[derive(Default)]
struct ProcessState {
    next_id: u64,
    children: HashMap<u64, Child>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ProcessState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn spawn(&self, spec: &CommandSpec) -> CoreResult<ProcessHandle> {
        let mut cmd = std::process::Command::new(&spec.program);
        cmd.args(&spec.args).stdin(Stdio::null());
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        let child = cmd.spawn().map_err(|source| ProcessFailure::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();

        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        state.children.insert(id, child);
        tracing::info!(id, pid, command = %spec.display(), "started background process");
        Ok(ProcessHandle { id, pid })
    }

    pub fn stop(&self, handle: &ProcessHandle) -> CoreResult<()> {
        let child = self.state().children.remove(&handle.id);
        if let Some(mut child) = child {
            let _ = child.kill();
            let _ = child.wait();
            tracing::info!(id = handle.id, pid = handle.pid, "stopped background process");
        }
        Ok(())
    }

    pub fn stop_all(&self) {
        let children: Vec<(u64, Child)> = self.state().children.drain().collect();
        for (id, mut child) in children {
            let _ = child.kill();
            let _ = child.wait();
            tracing::debug!(id, "stopped background process");
        }
    }

    pub fn is_running(&self, handle: &ProcessHandle) -> bool {
        let mut state = self.state();
        if let Some(child) = state.children.get_mut(&handle.id) {
            match child.try_wait() {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(_) => false,
            }
        } else {
            false
        }
    }
}
