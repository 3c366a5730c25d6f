//! Core of the tether control plane.
//!
//! Holds the agent configuration document, launches exactly one worker
//! process per run, and fans the worker's output out to live subscribers.
//!
//! ```text
//! ConfigStore --snapshot--> Supervisor --launch--> LaunchRegistry --> WorkerProcess
//!                               |                                        |
//!                               | monitor (exit polling)                 | WorkerOutput
//!                               v                                        v
//!                           SupervisorStatus                     drain loop --> LogBroadcaster
//!                                                                                  |
//!                                                                      LogSubscription (per viewer)
//! ```

pub mod broadcast;
pub mod config;
pub mod supervisor;
pub mod worker;

pub use broadcast::{BroadcastConfig, LogBroadcaster, LogSubscription, SubscriberOverflow};
pub use config::{AgentConfig, ConfigPatch, ConfigStore, PipelineMode, ValidationError};
pub use supervisor::{
    ExitReason, ExitReport, RunInfo, StartOutcome, StopOutcome, Supervisor, SupervisorConfig,
    SupervisorError, SupervisorState, SupervisorStatus,
};
pub use worker::{
    CommandLauncher, LaunchError, LaunchRegistry, LogLine, ReadOutcome, WorkerExit, WorkerLauncher,
    WorkerOutput, WorkerProcess, WorkerProgram,
};
