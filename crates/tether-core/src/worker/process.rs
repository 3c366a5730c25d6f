//! A single spawned worker process.

use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};

use chrono::{DateTime, Utc};
use tokio::process::{Child, Command};
use tracing::debug;

use super::LaunchError;
use super::launcher::WorkerCommand;
use super::output::WorkerOutput;

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed by one (Unix only).
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Handle to one running worker.
///
/// The child is killed if the handle is dropped while it is still running.
pub struct WorkerProcess {
    pid: u32,
    program: String,
    started_at: DateTime<Utc>,
    child: Child,
    /// Taken once by the drain loop.
    output: Option<WorkerOutput>,
    /// Cached once observed so the pid is never signalled after reaping.
    exit: Option<WorkerExit>,
}

impl fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("pid", &self.pid)
            .field("program", &self.program)
            .field("started_at", &self.started_at)
            .field("exit", &self.exit)
            .finish()
    }
}

impl WorkerProcess {
    /// Launch `command` with stdout and stderr captured and stdin closed.
    pub fn spawn(command: &WorkerCommand) -> Result<Self, LaunchError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);

        // Merge into the inherited environment rather than replacing it.
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: command.program.clone(),
            source,
        })?;

        let pid = child
            .id()
            .ok_or_else(|| LaunchError::NoPid(command.program.clone()))?;

        let output = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => Some(WorkerOutput::merged(stdout, stderr)),
            (Some(stdout), None) => Some(WorkerOutput::from_reader(stdout)),
            (None, Some(stderr)) => Some(WorkerOutput::from_reader(stderr)),
            (None, None) => None,
        };

        debug!(pid, program = %command.program, "worker process spawned");

        Ok(Self {
            pid,
            program: command.program.clone(),
            started_at: Utc::now(),
            child,
            output,
            exit: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Hand the output stream to its single reader. `None` on later calls.
    pub fn take_output(&mut self) -> Option<WorkerOutput> {
        self.output.take()
    }

    /// Ask the worker to stop. `graceful` sends SIGTERM on Unix;
    /// otherwise the process is killed outright. A no-op once the exit has
    /// been observed.
    pub fn terminate(&mut self, graceful: bool) -> io::Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }

        if graceful {
            #[cfg(unix)]
            {
                // SAFETY: pid is a child we spawned and have not yet reaped.
                let ret = unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGTERM) };
                if ret != 0 {
                    return Err(io::Error::last_os_error());
                }
                return Ok(());
            }
        }

        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already reaped by tokio: nothing left to kill.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Non-blocking check; `None` while the worker is still running.
    pub fn exit_status(&mut self) -> io::Result<Option<WorkerExit>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        let exit = self.child.try_wait()?.map(WorkerExit::from);
        self.exit = exit;
        Ok(exit)
    }

    /// Wait for the worker to exit.
    pub async fn wait(&mut self) -> io::Result<WorkerExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let exit = WorkerExit::from(self.child.wait().await?);
        self.exit = Some(exit);
        Ok(exit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::worker::output::ReadOutcome;

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: vec![("TETHER_TEST_VAR".to_string(), "from-env".to_string())],
        }
    }

    #[test]
    fn exit_display() {
        let code = WorkerExit {
            code: Some(3),
            signal: None,
        };
        assert_eq!(code.to_string(), "exit code 3");
        assert!(!code.success());

        let signalled = WorkerExit {
            code: None,
            signal: Some(9),
        };
        assert_eq!(signalled.to_string(), "signal 9");
    }

    #[tokio::test]
    async fn spawn_missing_binary_is_launch_error() {
        let command = WorkerCommand {
            program: "/nonexistent/path/to/worker".to_string(),
            args: Vec::new(),
            env: Vec::new(),
        };
        let err = WorkerProcess::spawn(&command).unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/path/to/worker"));
    }

    #[tokio::test]
    async fn captures_stdout_stderr_and_env() {
        let mut process =
            WorkerProcess::spawn(&sh("echo out; echo err 1>&2; echo \"$TETHER_TEST_VAR\""))
                .unwrap();
        assert!(process.pid() > 0);

        let mut output = process.take_output().expect("output available");
        assert!(process.take_output().is_none());

        let mut texts = Vec::new();
        loop {
            match output.read_line(Duration::from_secs(2)).await {
                ReadOutcome::Line(line) => texts.push(line.text().to_string()),
                ReadOutcome::Idle => continue,
                _ => break,
            }
        }
        texts.sort();
        assert_eq!(texts, vec!["err", "from-env", "out"]);

        let exit = process.wait().await.unwrap();
        assert!(exit.success());
    }

    #[tokio::test]
    async fn exit_status_is_none_while_running() {
        let mut process = WorkerProcess::spawn(&sh("exec sleep 30")).unwrap();
        assert_eq!(process.exit_status().unwrap(), None);

        process.terminate(false).unwrap();
        let exit = process.wait().await.unwrap();
        assert!(!exit.success());
        assert_eq!(process.exit_status().unwrap(), Some(exit));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn graceful_terminate_sends_sigterm() {
        let mut process = WorkerProcess::spawn(&sh("exec sleep 30")).unwrap();
        process.terminate(true).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .expect("sleep should exit on SIGTERM")
            .unwrap();
        assert_eq!(exit.signal, Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn terminate_after_exit_is_noop() {
        let mut process = WorkerProcess::spawn(&sh("exit 4")).unwrap();
        let exit = process.wait().await.unwrap();
        assert_eq!(exit.code, Some(4));
        process.terminate(true).unwrap();
        process.terminate(false).unwrap();
    }
}
