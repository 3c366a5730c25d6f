//! `tether run`: one worker in the foreground, no HTTP.

use anyhow::{Context, Result};

use tether_core::{ConfigStore, ExitReason, StartOutcome, Supervisor, SupervisorState};

use crate::settings::Settings;

/// Start one worker, print its output to stdout until it exits or Ctrl+C
/// arrives, and report how it ended.
pub async fn run_once(settings: &Settings, store: ConfigStore) -> Result<ExitReason> {
    let mut config = settings.supervisor_config();
    // The only subscriber attaches after spawn; replay what it missed.
    config.broadcast.backlog_lines = config.broadcast.backlog_lines.max(config.broadcast.tail_lines);

    let supervisor = Supervisor::new(store, settings.launch_registry(), config);
    let outcome = supervisor.start().await.context("failed to start worker")?;
    if let StartOutcome::Started { run_id, pid } = outcome {
        eprintln!("worker started (run {run_id}, pid {pid})");
    }

    let mut subscription = supervisor
        .subscribe()
        .await
        .context("worker exited before its output could be attached")?;
    let mut state = supervisor.watch_state();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            line = subscription.next_line() => match line {
                Some(line) => println!("{}", line.text()),
                None => break,
            },
            _ = &mut ctrl_c => {
                eprintln!("interrupted; stopping worker");
                interrupted = true;
                supervisor.stop().await;
                break;
            }
        }
    }

    // Idle is only published after the drain loop has finished. A worker
    // can close its output and keep running, so Ctrl+C still applies here.
    tokio::select! {
        idle = state.wait_for(|s| *s == SupervisorState::Idle) => {
            idle.map(|_| ()).context("supervisor dropped while waiting for the worker to exit")?;
        }
        _ = &mut ctrl_c, if !interrupted => {
            eprintln!("interrupted; stopping worker");
            supervisor.stop().await;
        }
    }
    while let Some(line) = subscription.try_next_line() {
        println!("{}", line.text());
    }

    let status = supervisor.status().await;
    let last = status
        .last_exit
        .context("worker exit was not recorded")?;
    match last.reason {
        ExitReason::Completed => eprintln!("worker completed"),
        ExitReason::Stopped { forced } => {
            eprintln!("worker stopped{}", if forced { " (killed)" } else { "" });
        }
        ExitReason::Crashed { code, signal } => {
            let how = match (code, signal) {
                (Some(code), _) => format!("exit code {code}"),
                (None, Some(signal)) => format!("signal {signal}"),
                (None, None) => "unknown status".to_string(),
            };
            eprintln!("worker crashed ({how}); last output:");
            for line in &last.output_tail {
                eprintln!("  {line}");
            }
        }
    }
    Ok(last.reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{CliOverrides, Settings, SettingsFile};
    use tether_test_utils::FakeWorker;

    fn settings_for(worker: &FakeWorker) -> Settings {
        let mut file = SettingsFile::default();
        file.worker.program = worker.program().to_string();
        file.worker.args = worker.args();
        file.worker.poll_interval_ms = 50;
        Settings::resolve_with(&CliOverrides::default(), Some(file), |_| None).unwrap()
    }

    #[tokio::test]
    async fn completed_worker_reports_completed() {
        let worker = FakeWorker::exits_after(0.1, "all done", 0);
        let reason = run_once(&settings_for(&worker), ConfigStore::new()).await.unwrap();
        assert_eq!(reason, ExitReason::Completed);
    }

    #[tokio::test]
    async fn crashing_worker_reports_crash() {
        let worker = FakeWorker::exits_after(0.1, "boom", 3);
        let reason = run_once(&settings_for(&worker), ConfigStore::new()).await.unwrap();
        assert_eq!(
            reason,
            ExitReason::Crashed {
                code: Some(3),
                signal: None
            }
        );
    }

    #[tokio::test]
    async fn missing_program_fails_to_start() {
        let mut settings = settings_for(&FakeWorker::long_running());
        settings.worker.program = "/nonexistent/tether-worker".to_string();
        let err = run_once(&settings, ConfigStore::new()).await.unwrap_err();
        assert!(format!("{err:#}").contains("failed to start worker"));
    }
}
