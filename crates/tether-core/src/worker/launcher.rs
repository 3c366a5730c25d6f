//! The `WorkerLauncher` trait -- how a pipeline mode becomes a process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::LaunchError;
use super::process::WorkerProcess;
use crate::config::{AgentConfig, PipelineMode};

/// Environment variable telling the worker which pipeline it was launched for.
pub const PIPELINE_ENV: &str = "TETHER_PIPELINE";

/// Starts workers for one [`PipelineMode`].
///
/// Object-safe so launchers can live as `Box<dyn WorkerLauncher>` in a
/// [`super::LaunchRegistry`].
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// The pipeline mode this launcher handles.
    fn mode(&self) -> PipelineMode;

    /// Spawn a worker for `config`.
    ///
    /// The worker receives the serialized config as its only input and
    /// its credentials through the environment.
    async fn spawn(&self, config: &AgentConfig) -> Result<WorkerProcess, LaunchError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn WorkerLauncher) {}
};

/// An executable plus the arguments placed before the config JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProgram {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl WorkerProgram {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for WorkerProgram {
    fn default() -> Self {
        Self::new("python3").with_args(["runner.py"])
    }
}

/// A fully resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Runs `program args... <config-json>`.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    mode: PipelineMode,
    program: WorkerProgram,
}

impl CommandLauncher {
    pub fn new(mode: PipelineMode, program: WorkerProgram) -> Self {
        Self { mode, program }
    }

    pub fn program(&self) -> &WorkerProgram {
        &self.program
    }

    /// Build the invocation for `config` without spawning anything.
    pub fn command(&self, config: &AgentConfig) -> Result<WorkerCommand, LaunchError> {
        let mut args = self.program.args.clone();
        args.push(config.to_json()?);

        let mut env = config.credential_env();
        env.push((PIPELINE_ENV.to_string(), self.mode.to_string()));

        Ok(WorkerCommand {
            program: self.program.program.clone(),
            args,
            env,
        })
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    fn mode(&self) -> PipelineMode {
        self.mode
    }

    async fn spawn(&self, config: &AgentConfig) -> Result<WorkerProcess, LaunchError> {
        let command = self.command(config)?;
        WorkerProcess::spawn(&command)
    }
}
