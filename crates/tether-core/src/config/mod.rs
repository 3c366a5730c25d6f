//! The agent configuration document and its in-memory store.
//!
//! A single [`AgentConfig`] lives in a [`ConfigStore`]. Clients change it
//! only through [`ConfigStore::update`], which applies a [`ConfigPatch`]:
//! every provided field replaces the stored one, except `api_keys`, which
//! is merged key by key.

pub mod document;
pub mod patch;
pub mod store;

pub use document::{AgentConfig, MAX_SPEECH_RATE, MIN_SPEECH_RATE, PipelineMode, credential_env_var};
pub use patch::ConfigPatch;
pub use store::ConfigStore;

/// A rejected configuration update. The store is left unchanged.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("config update must be a JSON object")]
    NotAnObject,

    #[error("invalid config update: {0}")]
    Malformed(String),

    #[error("unknown pipeline type '{0}' (expected 'realtime' or 'cascading')")]
    UnknownPipeline(String),

    #[error("speech_rate {0} is outside the allowed range {MIN_SPEECH_RATE}..={MAX_SPEECH_RATE}")]
    SpeechRateOutOfRange(f32),
}
