//! Worker processes: launching, output capture and termination.
//!
//! # Architecture
//!
//! ```text
//! Supervisor
//!     |
//!     v
//! LaunchRegistry --get(PipelineMode)--> &dyn WorkerLauncher
//!     |                                        |
//!     |   spawn(config) -----------------------+
//!     |        |
//!     |        v
//!     |   WorkerProcess { pid, child, output }
//!     |        |
//!     |   take_output() --> WorkerOutput::read_line()
//!     |   terminate(graceful)
//!     |   exit_status()
//! ```

pub mod launcher;
pub mod output;
pub mod process;
pub mod registry;

pub use launcher::{CommandLauncher, PIPELINE_ENV, WorkerCommand, WorkerLauncher, WorkerProgram};
pub use output::{LogLine, ReadOutcome, WorkerOutput};
pub use process::{WorkerExit, WorkerProcess};
pub use registry::LaunchRegistry;

use crate::config::PipelineMode;

/// The worker could not be started. Nothing is left running.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("no worker launcher registered for pipeline mode '{0}'")]
    UnsupportedMode(PipelineMode),

    #[error("failed to serialize agent config for the worker: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to spawn worker '{program}' -- is it installed and on PATH?")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker '{0}' exited before its pid could be read")]
    NoPid(String),
}
