//! Scripted stand-in for the external tools.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Mutex;
use workbench_core::{CommandRunner, CommandSpec, ProcessFailure, ProcessOutput};

type Hook = Box<dyn Fn(&CommandSpec) + Send + Sync>;

#[derive(Default)]
pub struct ScriptedRunner {
    calls: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, Result<Vec<String>, ProcessFailure>)>>,
    hooks: Mutex<Vec<(String, Hook)>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// `create --prefix X` makes X, `env remove --prefix X` deletes it.
    pub fn with_fs_effects() -> Self {
        let runner = Self::new();
        runner.on(" create ", |spec| {
            if let Some(prefix) = arg_after(spec, "--prefix") {
                let _ = std::fs::create_dir_all(prefix);
            }
        });
        runner.on(" env remove ", |spec| {
            if let Some(prefix) = arg_after(spec, "--prefix") {
                let _ = std::fs::remove_dir_all(prefix);
            }
        });
        runner
    }

    /// Next call whose command line contains `pattern` gets `result`.
    pub fn respond(&self, pattern: &str, result: Result<Vec<String>, ProcessFailure>) {
        self.responses.lock().unwrap().push((pattern.to_string(), result));
    }

    /// Side effect run for every successful call containing `pattern`.
    pub fn on(&self, pattern: &str, hook: impl Fn(&CommandSpec) + Send + Sync + 'static) {
        self.hooks.lock().unwrap().push((pattern.to_string(), Box::new(hook)));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(pattern)).count()
    }
}

pub fn arg_after(spec: &CommandSpec, flag: &str) -> Option<PathBuf> {
    spec.args
        .iter()
        .position(|a| a == flag)
        .and_then(|i| spec.args.get(i + 1))
        .map(PathBuf::from)
}

pub fn failure(stderr: &str) -> ProcessFailure {
    ProcessFailure::Exit {
        program: "micromamba".to_string(),
        code: Some(1),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, ProcessFailure> {
        let line = spec.display();
        self.calls.lock().unwrap().push(line.clone());
        // Let other tasks run, as a real child process would.
        tokio::task::yield_now().await;

        let scripted = {
            let mut responses = self.responses.lock().unwrap();
            responses
                .iter()
                .position(|(pattern, _)| line.contains(pattern.as_str()))
                .map(|i| responses.remove(i).1)
        };
        let stdout = match scripted {
            Some(Err(failure)) => return Err(failure),
            Some(Ok(stdout)) => stdout,
            None => Vec::new(),
        };
        for (pattern, hook) in self.hooks.lock().unwrap().iter() {
            if line.contains(pattern.as_str()) {
                hook(spec);
            }
        }
        Ok(ProcessOutput { code: 0, stdout })
    }
}
