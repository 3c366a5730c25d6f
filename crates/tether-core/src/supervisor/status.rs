//! Status types reported by the [`super::Supervisor`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::PipelineMode;
use crate::worker::WorkerExit;

/// Supervisor lifecycle.
///
/// ```text
/// idle -> starting -> running -> stopping -> idle
///                        |
///                        +--(worker exits on its own)--> idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Result of [`super::Supervisor::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { run_id: Uuid, pid: u32 },
    AlreadyRunning,
}

/// Result of [`super::Supervisor::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StopOutcome {
    /// The worker is gone. `forced` is set when it had to be killed after
    /// ignoring the graceful request.
    Stopped { forced: bool },
    NotRunning,
}

/// The active run, as visible to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunInfo {
    pub run_id: Uuid,
    pub pid: u32,
    pub mode: PipelineMode,
    pub started_at: DateTime<Utc>,
}

/// Why the last run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitReason {
    /// Ended by a client `stop`.
    Stopped { forced: bool },
    /// Exited on its own with status 0.
    Completed,
    /// Exited on its own with a non-zero status or a signal.
    Crashed {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

impl ExitReason {
    /// Classify a spontaneous exit.
    pub fn from_exit(exit: WorkerExit) -> Self {
        if exit.success() {
            ExitReason::Completed
        } else {
            ExitReason::Crashed {
                code: exit.code,
                signal: exit.signal,
            }
        }
    }

    pub fn is_crash(&self) -> bool {
        matches!(self, ExitReason::Crashed { .. })
    }
}

/// How the most recent run ended, with its last output lines.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitReport {
    pub run_id: Uuid,
    pub mode: PipelineMode,
    pub reason: ExitReason,
    pub finished_at: DateTime<Utc>,
    pub output_tail: Vec<String>,
}

/// Snapshot returned by [`super::Supervisor::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub run: Option<RunInfo>,
    pub last_exit: Option<ExitReport>,
}
