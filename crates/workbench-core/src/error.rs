use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("config file {path} is invalid: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Process(#[from] ProcessFailure),
}

/// Failure of a single external-tool invocation.
#[derive(Debug, Error)]
pub enum ProcessFailure {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {}: {stderr}", exit_label(.code))]
    Exit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{program} timed out after {}s", .after.as_secs())]
    Timeout { program: String, after: Duration },
    #[error("{program} was cancelled")]
    Cancelled { program: String },
}

impl ProcessFailure {
    pub fn program(&self) -> &str {
        match self {
            ProcessFailure::Spawn { program, .. }
            | ProcessFailure::Exit { program, .. }
            | ProcessFailure::Timeout { program, .. }
            | ProcessFailure::Cancelled { program } => program,
        }
    }

    /// Diagnostic text the tool wrote to its error stream, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ProcessFailure::Exit { stderr, .. } if !stderr.is_empty() => Some(stderr),
            _ => None,
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "a signal".to_string(),
    }
}

/// Render an error and every `source()` below it, one per line.
pub fn format_error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut chain = vec![error.to_string()];
    let mut source = error.source();

    while let Some(err) = source {
        chain.push(format!("  caused by: {}", err));
        source = err.source();
    }

    chain.join("\n")
}
