//! In-memory holder of the current [`AgentConfig`].

use std::sync::{Arc, PoisonError, RwLock};

use super::{AgentConfig, ConfigPatch, ValidationError};

/// Shared, cloneable handle to the current agent configuration.
///
/// Reads always see the latest successfully applied update; there is no
/// history. Cloning the store yields another handle to the same document.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    document: Arc<RwLock<AgentConfig>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an explicit document instead of the defaults.
    pub fn with_document(document: AgentConfig) -> Self {
        Self {
            document: Arc::new(RwLock::new(document)),
        }
    }

    /// Return a copy of the current document.
    pub fn get(&self) -> AgentConfig {
        self.document
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate and apply `patch`, returning the resulting document.
    pub fn update(&self, patch: ConfigPatch) -> Result<AgentConfig, ValidationError> {
        patch.validate()?;
        let fields = patch.provided_fields();

        let mut document = self
            .document
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        patch.apply_to(&mut document);
        let updated = document.clone();
        drop(document);

        tracing::info!(
            fields = ?fields,
            pipeline = %updated.pipeline_type,
            "agent config updated"
        );
        Ok(updated)
    }

    /// Parse `value` as a [`ConfigPatch`] and apply it.
    pub fn update_json(&self, value: serde_json::Value) -> Result<AgentConfig, ValidationError> {
        self.update(ConfigPatch::from_value(value)?)
    }
}
