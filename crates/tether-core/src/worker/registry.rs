//! Registry mapping pipeline modes to launchers.

use std::collections::HashMap;

use super::LaunchError;
use super::launcher::{CommandLauncher, WorkerLauncher, WorkerProgram};
use super::process::WorkerProcess;
use crate::config::{AgentConfig, PipelineMode};

/// A collection of registered [`WorkerLauncher`]s, keyed by mode.
///
/// # Example
///
/// ```ignore
/// let mut registry = LaunchRegistry::new();
/// registry.register(CommandLauncher::new(PipelineMode::Realtime, program));
/// let process = registry.launch(&config).await?;
/// ```
#[derive(Default)]
pub struct LaunchRegistry {
    launchers: HashMap<PipelineMode, Box<dyn WorkerLauncher>>,
}

impl LaunchRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry running the same program for every mode.
    pub fn with_program(program: WorkerProgram) -> Self {
        let mut registry = Self::new();
        for mode in PipelineMode::ALL {
            registry.register(CommandLauncher::new(mode, program.clone()));
        }
        registry
    }

    /// Register a launcher under [`WorkerLauncher::mode`], returning the one
    /// it replaced.
    pub fn register(
        &mut self,
        launcher: impl WorkerLauncher + 'static,
    ) -> Option<Box<dyn WorkerLauncher>> {
        self.launchers.insert(launcher.mode(), Box::new(launcher))
    }

    pub fn get(&self, mode: PipelineMode) -> Option<&dyn WorkerLauncher> {
        self.launchers.get(&mode).map(|b| b.as_ref())
    }

    /// Registered modes, sorted.
    pub fn modes(&self) -> Vec<PipelineMode> {
        let mut modes: Vec<_> = self.launchers.keys().copied().collect();
        modes.sort();
        modes
    }

    pub fn len(&self) -> usize {
        self.launchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.launchers.is_empty()
    }

    /// Spawn a worker using the launcher for `config.pipeline_type`.
    ///
    /// Fails with [`LaunchError::UnsupportedMode`] before anything is
    /// spawned if no launcher is registered for the mode.
    pub async fn launch(&self, config: &AgentConfig) -> Result<WorkerProcess, LaunchError> {
        let launcher = self
            .get(config.pipeline_type)
            .ok_or(LaunchError::UnsupportedMode(config.pipeline_type))?;
        launcher.spawn(config).await
    }
}

impl std::fmt::Debug for LaunchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchRegistry")
            .field("modes", &self.modes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Launcher that never spawns, used to check registry bookkeeping.
    struct RefusingLauncher {
        mode: PipelineMode,
    }

    #[async_trait]
    impl WorkerLauncher for RefusingLauncher {
        fn mode(&self) -> PipelineMode {
            self.mode
        }

        async fn spawn(&self, _config: &AgentConfig) -> Result<WorkerProcess, LaunchError> {
            Err(LaunchError::NoPid("refusing".to_string()))
        }
    }

    #[test]
    fn registry_starts_empty() {
        let registry = LaunchRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.modes().is_empty());
    }

    #[test]
    fn with_program_covers_every_mode() {
        let registry = LaunchRegistry::with_program(WorkerProgram::new("worker"));
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.modes(),
            vec![PipelineMode::Realtime, PipelineMode::Cascading]
        );
    }

    #[test]
    fn register_replaces_existing() {
        let mut registry = LaunchRegistry::with_program(WorkerProgram::new("worker"));
        let old = registry.register(RefusingLauncher {
            mode: PipelineMode::Cascading,
        });
        assert!(old.is_some());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn launch_rejects_unregistered_mode() {
        let mut registry = LaunchRegistry::new();
        registry.register(RefusingLauncher {
            mode: PipelineMode::Realtime,
        });

        let mut config = AgentConfig::default();
        config.pipeline_type = PipelineMode::Cascading;
        let err = registry.launch(&config).await.unwrap_err();
        assert!(matches!(
            err,
            LaunchError::UnsupportedMode(PipelineMode::Cascading)
        ));
    }

    #[tokio::test]
    async fn launch_dispatches_on_pipeline_type() {
        let mut registry = LaunchRegistry::new();
        registry.register(RefusingLauncher {
            mode: PipelineMode::Realtime,
        });
        let err = registry.launch(&AgentConfig::default()).await.unwrap_err();
        assert!(matches!(err, LaunchError::NoPid(_)));
    }

    #[test]
    fn registry_debug_shows_modes() {
        let registry = LaunchRegistry::with_program(WorkerProgram::new("worker"));
        let debug = format!("{registry:?}");
        assert!(debug.contains("Realtime"));
        assert!(debug.contains("Cascading"));
    }
}
