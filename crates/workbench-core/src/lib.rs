pub mod config;
pub mod error;
pub mod logging;
pub mod process;

pub use config::{CoreConfig, EnvManagerConfig, NotebookConfig, PathsConfig, ProcessConfig};
pub use error::{format_error_chain, CoreError, CoreResult, ProcessFailure};
pub use process::{
    CancelHandle, CommandRunner, CommandSpec, ProcessHandle, ProcessManager, ProcessOutput,
    ProcessRunner,
};
