//! Settings file management for tether.
//!
//! Provides a TOML settings file at `~/.config/tether/config.toml` and a
//! resolution chain: CLI flag > env var > settings file > default.
//!
//! These are process settings (where to listen, which worker to run). The
//! agent configuration document lives in memory in the
//! [`tether_core::ConfigStore`] and is never written here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use tether_core::{
    BroadcastConfig, CommandLauncher, LaunchRegistry, PipelineMode, SupervisorConfig,
    WorkerProgram,
};

pub const ENV_BIND: &str = "TETHER_BIND";
pub const ENV_PORT: &str = "TETHER_PORT";
pub const ENV_WORKER_PROGRAM: &str = "TETHER_WORKER_PROGRAM";

// -----------------------------------------------------------------------
// Settings file types
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsFile {
    pub server: ServerSection,
    pub worker: WorkerSection,
    pub logs: LogsSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub program: String,
    pub args: Vec<String>,
    pub grace_period_secs: u64,
    pub poll_interval_ms: u64,
    /// Per-mode override of `program`/`args`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime: Option<WorkerProgram>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cascading: Option<WorkerProgram>,
}

impl Default for WorkerSection {
    fn default() -> Self {
        let program = WorkerProgram::default();
        Self {
            program: program.program,
            args: program.args,
            grace_period_secs: 5,
            poll_interval_ms: 100,
            realtime: None,
            cascading: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsSection {
    pub subscriber_queue: usize,
    pub backlog_lines: usize,
    pub crash_tail_lines: usize,
}

impl Default for LogsSection {
    fn default() -> Self {
        let defaults = BroadcastConfig::default();
        Self {
            subscriber_queue: defaults.subscriber_capacity,
            backlog_lines: defaults.backlog_lines,
            crash_tail_lines: defaults.tail_lines,
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the tether config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/tether` or `~/.config/tether`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("tether");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("tether")
}

/// Return the default path to the settings file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse a settings file. Returns an error if it does not exist.
pub fn load_settings(path: &Path) -> Result<SettingsFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file at {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse settings file at {}", path.display()))
}

/// Serialize and write a settings file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_settings(path: &Path, settings: &SettingsFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(settings).context("failed to serialize settings")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write settings file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved settings
// -----------------------------------------------------------------------

/// Values given on the command line. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
}

/// Fully resolved settings, ready for use.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub bind: String,
    pub port: u16,
    pub worker: WorkerSection,
    pub logs: LogsSection,
}

impl Settings {
    /// Resolve from `path` (if it exists) and the process environment.
    pub fn resolve(cli: &CliOverrides, path: &Path) -> Result<Self> {
        let file = if path.exists() {
            Some(load_settings(path)?)
        } else {
            None
        };
        Self::resolve_with(cli, file, |key| std::env::var(key).ok())
    }

    /// Resolve using the chain: CLI flag > env var > settings file > default.
    ///
    /// `env` looks up environment variables, so tests can supply their own.
    pub fn resolve_with(
        cli: &CliOverrides,
        file: Option<SettingsFile>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let file = file.unwrap_or_default();

        let bind = cli
            .bind
            .clone()
            .or_else(|| env(ENV_BIND))
            .unwrap_or(file.server.bind);

        let port = match (cli.port, env(ENV_PORT)) {
            (Some(port), _) => port,
            (None, Some(raw)) => raw
                .parse()
                .with_context(|| format!("{ENV_PORT} is not a valid port: {raw:?}"))?,
            (None, None) => file.server.port,
        };

        let mut worker = file.worker;
        if let Some(program) = env(ENV_WORKER_PROGRAM) {
            worker.program = program;
        }

        Ok(Self {
            bind,
            port,
            worker,
            logs: file.logs,
        })
    }

    /// The worker program for `mode`, honouring per-mode overrides.
    pub fn worker_program(&self, mode: PipelineMode) -> WorkerProgram {
        let override_for_mode = match mode {
            PipelineMode::Realtime => self.worker.realtime.as_ref(),
            PipelineMode::Cascading => self.worker.cascading.as_ref(),
        };
        override_for_mode.cloned().unwrap_or_else(|| {
            WorkerProgram::new(&self.worker.program).with_args(self.worker.args.iter().cloned())
        })
    }

    /// One launcher per pipeline mode.
    pub fn launch_registry(&self) -> LaunchRegistry {
        let mut registry = LaunchRegistry::new();
        for mode in PipelineMode::ALL {
            registry.register(CommandLauncher::new(mode, self.worker_program(mode)));
        }
        registry
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            grace_period: Duration::from_secs(self.worker.grace_period_secs),
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms.max(1)),
            broadcast: BroadcastConfig {
                subscriber_capacity: self.logs.subscriber_queue,
                backlog_lines: self.logs.backlog_lines,
                tail_lines: self.logs.crash_tail_lines,
            },
        }
    }

    /// The resolved values in settings-file form, for display.
    pub fn to_file(&self) -> SettingsFile {
        SettingsFile {
            server: ServerSection {
                bind: self.bind.clone(),
                port: self.port,
            },
            worker: self.worker.clone(),
            logs: self.logs.clone(),
        }
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
