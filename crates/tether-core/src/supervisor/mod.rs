//! The supervisor: owns at most one worker run at a time.
//!
//! All state transitions happen under a single mutex. The mutex is never
//! held while waiting out a grace period, so status reads, config reads and
//! log subscriptions keep working while a worker shuts down.
//!
//! Each run has two background tasks sharing one [`CancellationToken`]:
//! the drain loop (sole reader of the worker's output) and a monitor that
//! polls for a spontaneous exit once per poll interval.

pub mod status;

pub use status::{
    ExitReason, ExitReport, RunInfo, StartOutcome, StopOutcome, SupervisorState, SupervisorStatus,
};

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broadcast::{BroadcastConfig, DrainSummary, LogBroadcaster, LogSubscription, drain_output};
use crate::config::{ConfigStore, PipelineMode};
use crate::worker::{LaunchError, LaunchRegistry, WorkerExit, WorkerProcess};

/// Timing and buffering knobs for a [`Supervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// How long a worker gets to exit after SIGTERM before it is killed.
    pub grace_period: Duration,
    /// Bound on every wait in the drain loop and exit monitor.
    pub poll_interval: Duration,
    pub broadcast: BroadcastConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            broadcast: BroadcastConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("timed out after {timeout:?} waiting for supervisor to become {target}")]
    WaitTimeout {
        target: SupervisorState,
        timeout: Duration,
    },
}

struct ActiveRun {
    info: RunInfo,
    process: WorkerProcess,
    broadcaster: LogBroadcaster,
    cancel: CancellationToken,
    drain: JoinHandle<DrainSummary>,
}

struct LastExit {
    run_id: Uuid,
    mode: PipelineMode,
    reason: ExitReason,
    finished_at: DateTime<Utc>,
    broadcaster: LogBroadcaster,
}

/// A stop in progress. Later `stop` calls wait on `done`.
struct PendingStop {
    run_id: Uuid,
    broadcaster: LogBroadcaster,
    done: watch::Receiver<Option<StopOutcome>>,
}

struct Inner {
    state: SupervisorState,
    run: Option<ActiveRun>,
    /// Set exactly while `state` is `Stopping`.
    stopping: Option<PendingStop>,
    last_exit: Option<LastExit>,
}

struct Shared {
    store: ConfigStore,
    launchers: LaunchRegistry,
    config: SupervisorConfig,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SupervisorState>,
}

/// Cloneable handle; all clones control the same worker slot.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &*self.shared.state_tx.borrow())
            .field("launchers", &self.shared.launchers)
            .field("config", &self.shared.config)
            .finish()
    }
}

impl Supervisor {
    pub fn new(store: ConfigStore, launchers: LaunchRegistry, config: SupervisorConfig) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::Idle);
        Self {
            shared: Arc::new(Shared {
                store,
                launchers,
                config,
                inner: Mutex::new(Inner {
                    state: SupervisorState::Idle,
                    run: None,
                    stopping: None,
                    last_exit: None,
                }),
                state_tx,
            }),
        }
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.shared.store
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.config
    }

    fn set_state(&self, inner: &mut MutexGuard<'_, Inner>, state: SupervisorState) {
        inner.state = state;
        self.shared.state_tx.send_replace(state);
    }

    /// Launch a worker with a snapshot of the current config.
    ///
    /// Returns [`StartOutcome::AlreadyRunning`] without side effects while a
    /// worker is starting, running or stopping. On launch failure the
    /// supervisor is back in `Idle`.
    pub async fn start(&self) -> Result<StartOutcome, SupervisorError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state != SupervisorState::Idle {
            tracing::info!(state = %inner.state, "start requested while a worker is active");
            return Ok(StartOutcome::AlreadyRunning);
        }
        self.set_state(&mut inner, SupervisorState::Starting);

        let snapshot = self.shared.store.get();
        let mode = snapshot.pipeline_type;
        let mut process = match self.shared.launchers.launch(&snapshot).await {
            Ok(process) => process,
            Err(e) => {
                tracing::warn!(mode = %mode, error = %e, "failed to launch worker");
                self.set_state(&mut inner, SupervisorState::Idle);
                return Err(e.into());
            }
        };

        let run_id = Uuid::new_v4();
        let pid = process.pid();
        let poll_interval = self.shared.config.poll_interval;
        let broadcaster = LogBroadcaster::new(self.shared.config.broadcast.clone());
        let cancel = CancellationToken::new();

        let drain = match process.take_output() {
            Some(output) => tokio::spawn(drain_output(
                output,
                broadcaster.clone(),
                cancel.clone(),
                poll_interval,
            )),
            None => {
                tracing::warn!(%run_id, pid, "worker has no captured output");
                broadcaster.close();
                tokio::spawn(async { DrainSummary::default() })
            }
        };

        inner.run = Some(ActiveRun {
            info: RunInfo {
                run_id,
                pid,
                mode,
                started_at: process.started_at(),
            },
            process,
            broadcaster,
            cancel: cancel.clone(),
            drain,
        });
        self.set_state(&mut inner, SupervisorState::Running);
        drop(inner);

        tokio::spawn(monitor_run(
            Arc::downgrade(&self.shared),
            run_id,
            cancel,
            poll_interval,
        ));

        tracing::info!(%run_id, pid, mode = %mode, "worker started");
        Ok(StartOutcome::Started { run_id, pid })
    }

    /// Stop the worker: SIGTERM, wait up to the grace period, then kill.
    ///
    /// Always ends in `Idle` once the process is confirmed dead. A call that
    /// arrives while another stop is in progress waits for that same stop
    /// and reports its result, even if a new run starts right after it.
    ///
    /// The shutdown itself runs on its own task, so dropping this future
    /// (for example when an HTTP client disconnects) never leaves the
    /// supervisor stuck in `Stopping`.
    pub async fn stop(&self) -> StopOutcome {
        let mut inner = self.shared.inner.lock().await;
        match inner.state {
            SupervisorState::Idle => return StopOutcome::NotRunning,
            SupervisorState::Stopping => {
                let done = inner.stopping.as_ref().map(|pending| pending.done.clone());
                drop(inner);
                return wait_for_stop(done).await;
            }
            SupervisorState::Starting | SupervisorState::Running => {}
        }

        let Some(run) = inner.run.take() else {
            self.set_state(&mut inner, SupervisorState::Idle);
            return StopOutcome::NotRunning;
        };
        let (done_tx, done_rx) = watch::channel(None);
        inner.stopping = Some(PendingStop {
            run_id: run.info.run_id,
            broadcaster: run.broadcaster.clone(),
            done: done_rx.clone(),
        });
        self.set_state(&mut inner, SupervisorState::Stopping);
        drop(inner);

        let supervisor = self.clone();
        tokio::spawn(async move {
            let outcome = supervisor.finish_stop(run).await;
            done_tx.send_replace(Some(outcome));
        });
        wait_for_stop(Some(done_rx)).await
    }

    /// Terminate a run already taken out of `Inner`, then publish `Idle`.
    async fn finish_stop(&self, mut run: ActiveRun) -> StopOutcome {
        let run_id = run.info.run_id;
        tracing::info!(%run_id, pid = run.info.pid, "stopping worker");

        let reason = match run.process.exit_status() {
            // Exited between monitor polls: report what actually happened.
            Ok(Some(exit)) => ExitReason::from_exit(exit),
            _ => ExitReason::Stopped {
                forced: terminate(&mut run.process, self.shared.config.grace_period).await,
            },
        };

        run.cancel.cancel();
        if let Err(e) = (&mut run.drain).await {
            tracing::warn!(%run_id, error = %e, "drain task failed");
        }

        let mut inner = self.shared.inner.lock().await;
        inner.last_exit = Some(LastExit {
            run_id,
            mode: run.info.mode,
            reason,
            finished_at: Utc::now(),
            broadcaster: run.broadcaster.clone(),
        });
        if inner.stopping.as_ref().is_some_and(|pending| pending.run_id == run_id) {
            inner.stopping = None;
        }
        self.set_state(&mut inner, SupervisorState::Idle);
        drop(inner);

        tracing::info!(%run_id, reason = ?reason, "worker stopped");
        let forced = matches!(reason, ExitReason::Stopped { forced: true });
        StopOutcome::Stopped { forced }
    }

    /// Stop any running worker before the host process exits.
    pub async fn shutdown(&self) {
        match self.stop().await {
            StopOutcome::Stopped { forced } => {
                tracing::info!(forced, "worker stopped during shutdown");
            }
            StopOutcome::NotRunning => {}
        }
    }

    /// Attach to the current run's output. `None` when idle.
    ///
    /// While stopping, the subscription still receives the lines drained
    /// before the worker's output closes.
    pub async fn subscribe(&self) -> Option<LogSubscription> {
        let inner = self.shared.inner.lock().await;
        match (&inner.run, &inner.stopping) {
            (Some(run), _) => Some(run.broadcaster.subscribe()),
            (None, Some(pending)) => Some(pending.broadcaster.subscribe()),
            (None, None) => None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.shared.state_tx.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.shared.state_tx.subscribe()
    }

    /// Wait until the supervisor is in `target`, up to `timeout`.
    pub async fn wait_for_state(
        &self,
        target: SupervisorState,
        timeout: Duration,
    ) -> Result<(), SupervisorError> {
        let mut rx = self.watch_state();
        match tokio::time::timeout(timeout, rx.wait_for(|s| *s == target)).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(SupervisorError::WaitTimeout { target, timeout }),
        }
    }

    pub async fn status(&self) -> SupervisorStatus {
        let inner = self.shared.inner.lock().await;
        let tail_lines = self.shared.config.broadcast.tail_lines;
        SupervisorStatus {
            state: inner.state,
            run: inner.run.as_ref().map(|run| run.info.clone()),
            last_exit: inner.last_exit.as_ref().map(|exit| ExitReport {
                run_id: exit.run_id,
                mode: exit.mode,
                reason: exit.reason,
                finished_at: exit.finished_at,
                output_tail: exit
                    .broadcaster
                    .recent(tail_lines)
                    .iter()
                    .map(|line| line.text().to_string())
                    .collect(),
            }),
        }
    }

    /// Record a spontaneous exit of `run_id`. Returns `true` when the
    /// monitor for that run should stop polling.
    async fn check_exit(&self, run_id: Uuid) -> bool {
        let mut inner = self.shared.inner.lock().await;
        if inner.state != SupervisorState::Running {
            return true;
        }
        let exit = match inner.run.as_mut() {
            Some(run) if run.info.run_id == run_id => match run.process.exit_status() {
                Ok(Some(exit)) => exit,
                Ok(None) => return false,
                Err(e) => {
                    tracing::warn!(%run_id, error = %e, "failed to poll worker exit status");
                    return false;
                }
            },
            _ => return true,
        };
        let Some(run) = inner.run.take() else {
            return true;
        };

        // The drain flush is bounded by one poll interval, so holding the
        // lock here keeps the tail complete by the time `Idle` is visible.
        run.cancel.cancel();
        if let Err(e) = run.drain.await {
            tracing::warn!(%run_id, error = %e, "drain task failed");
        }

        inner.last_exit = Some(LastExit {
            run_id,
            mode: run.info.mode,
            reason: ExitReason::from_exit(exit),
            finished_at: Utc::now(),
            broadcaster: run.broadcaster.clone(),
        });
        self.set_state(&mut inner, SupervisorState::Idle);
        drop(inner);

        report_exit(&run.info, exit, &run.broadcaster, self.shared.config.broadcast.tail_lines);
        true
    }
}

/// Wait for the stop behind `done` to publish its outcome.
async fn wait_for_stop(done: Option<watch::Receiver<Option<StopOutcome>>>) -> StopOutcome {
    let Some(mut done) = done else {
        return StopOutcome::NotRunning;
    };
    let outcome = match done.wait_for(Option::is_some).await {
        Ok(outcome) => *outcome,
        Err(_) => None,
    };
    outcome.unwrap_or_else(|| {
        tracing::warn!("stop task ended without reporting an outcome");
        StopOutcome::NotRunning
    })
}

/// Poll for a spontaneous exit of one run until it ends or is cancelled.
async fn monitor_run(
    shared: Weak<Shared>,
    run_id: Uuid,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(poll_interval) => {}
        }
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if (Supervisor { shared }).check_exit(run_id).await {
            return;
        }
    }
}

/// Graceful-then-forced termination. Returns `true` if the kill was forced.
async fn terminate(process: &mut WorkerProcess, grace_period: Duration) -> bool {
    let pid = process.pid();

    match process.terminate(true) {
        Ok(()) => match tokio::time::timeout(grace_period, process.wait()).await {
            Ok(Ok(exit)) => {
                tracing::debug!(pid, %exit, "worker exited after graceful termination");
                return false;
            }
            Ok(Err(e)) => {
                tracing::warn!(pid, error = %e, "error waiting for worker; forcing kill");
            }
            Err(_elapsed) => {
                tracing::warn!(pid, ?grace_period, "worker ignored graceful termination; forcing kill");
            }
        },
        Err(e) => {
            tracing::warn!(pid, error = %e, "graceful termination failed; forcing kill");
        }
    }

    if let Err(e) = process.terminate(false) {
        tracing::warn!(pid, error = %e, "failed to kill worker");
    }
    match process.wait().await {
        Ok(exit) => tracing::debug!(pid, %exit, "worker killed"),
        Err(e) => tracing::warn!(pid, error = %e, "error reaping killed worker"),
    }
    true
}

fn report_exit(info: &RunInfo, exit: WorkerExit, broadcaster: &LogBroadcaster, tail_lines: usize) {
    if exit.success() {
        tracing::info!(run_id = %info.run_id, pid = info.pid, "worker exited");
        return;
    }
    let tail: Vec<String> = broadcaster
        .recent(tail_lines)
        .iter()
        .map(|line| line.text().to_string())
        .collect();
    tracing::warn!(
        run_id = %info.run_id,
        pid = info.pid,
        exit_code = ?exit.code,
        signal = ?exit.signal,
        tail = ?tail,
        "worker crashed"
    );
}
