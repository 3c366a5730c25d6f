//! Shared test utilities for tether integration tests.
//!
//! [`FakeWorker`] stands in for the real pipeline runner: a shell script in
//! a temporary directory, invoked as `/bin/sh <script> <config-json>`. The
//! config JSON arrives as `$1`.
//!
//! Scripts are run through `/bin/sh` rather than executed directly so that
//! writing and spawning them concurrently never hits `ETXTBSY`.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

/// Shell used to run fake worker scripts.
pub const SHELL: &str = "/bin/sh";

/// A throwaway worker script. The script is deleted on drop.
pub struct FakeWorker {
    _dir: TempDir,
    script: PathBuf,
}

impl FakeWorker {
    /// Write `body` as the worker script.
    pub fn new(body: &str) -> Self {
        let dir = TempDir::new().expect("failed to create temp dir for fake worker");
        let script = dir.path().join("worker.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n"))
            .expect("failed to write fake worker script");
        Self { _dir: dir, script }
    }

    /// Prints a startup line, then sleeps until terminated.
    pub fn long_running() -> Self {
        Self::new("echo worker ready\nexec sleep 3600")
    }

    /// Ignores SIGTERM, so only a forced kill ends it.
    pub fn ignores_terminate() -> Self {
        Self::new("trap '' TERM\necho ignoring term\nwhile true; do sleep 1; done")
    }

    /// Echoes its config argument, then sleeps until terminated.
    pub fn echoes_config() -> Self {
        Self::new("printf '%s\\n' \"$1\"\nexec sleep 3600")
    }

    /// Prints `message` and exits with `code` after `delay_secs`.
    pub fn exits_after(delay_secs: f32, message: &str, code: i32) -> Self {
        Self::new(&format!("sleep {delay_secs}\necho '{message}'\nexit {code}"))
    }

    pub fn program(&self) -> &str {
        SHELL
    }

    pub fn args(&self) -> Vec<String> {
        vec![self.script.display().to_string()]
    }

    pub fn script(&self) -> &Path {
        &self.script
    }
}

/// Poll `check` every `poll` until it returns `true` or `timeout` elapses.
/// Returns whether the condition was met.
pub async fn wait_until<F, Fut>(timeout: Duration, poll: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}
