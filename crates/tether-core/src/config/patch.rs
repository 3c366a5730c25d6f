//! Partial updates to the agent configuration.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

use super::document::{AgentConfig, MAX_SPEECH_RATE, MIN_SPEECH_RATE, PipelineMode, redact};
use super::ValidationError;

/// A partial [`AgentConfig`]. Absent (or `null`) fields are left alone.
#[derive(Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigPatch {
    pub system_prompt: Option<String>,
    pub pipeline_type: Option<PipelineMode>,
    pub llm_model: Option<String>,
    pub stt_model: Option<String>,
    pub tts_model: Option<String>,
    pub voice: Option<String>,
    pub language: Option<String>,
    pub speech_rate: Option<f32>,
    pub api_keys: Option<BTreeMap<String, String>>,
}

impl fmt::Debug for ConfigPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigPatch")
            .field("system_prompt", &self.system_prompt)
            .field("pipeline_type", &self.pipeline_type)
            .field("llm_model", &self.llm_model)
            .field("stt_model", &self.stt_model)
            .field("tts_model", &self.tts_model)
            .field("voice", &self.voice)
            .field("language", &self.language)
            .field("speech_rate", &self.speech_rate)
            .field("api_keys", &self.api_keys.as_ref().map(redact))
            .finish()
    }
}

impl ConfigPatch {
    /// Parse a patch from an arbitrary JSON value, rejecting non-objects,
    /// unknown fields and mistyped values.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ValidationError> {
        if !value.is_object() {
            return Err(ValidationError::NotAnObject);
        }
        serde_json::from_value(value).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    /// Parse a patch from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ValidationError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    /// Check value ranges that the type system does not capture.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(rate) = self.speech_rate {
            if !rate.is_finite() || !(MIN_SPEECH_RATE..=MAX_SPEECH_RATE).contains(&rate) {
                return Err(ValidationError::SpeechRateOutOfRange(rate));
            }
        }
        Ok(())
    }

    /// Names of the fields this patch sets (credential providers included,
    /// never their values).
    pub fn provided_fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        let scalar = [
            ("system_prompt", self.system_prompt.is_some()),
            ("pipeline_type", self.pipeline_type.is_some()),
            ("llm_model", self.llm_model.is_some()),
            ("stt_model", self.stt_model.is_some()),
            ("tts_model", self.tts_model.is_some()),
            ("voice", self.voice.is_some()),
            ("language", self.language.is_some()),
            ("speech_rate", self.speech_rate.is_some()),
        ];
        fields.extend(scalar.iter().filter(|(_, set)| *set).map(|(name, _)| name.to_string()));
        if let Some(keys) = &self.api_keys {
            fields.extend(keys.keys().map(|provider| format!("api_keys.{provider}")));
        }
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.provided_fields().is_empty()
    }

    /// Apply onto `config`. Callers validate first.
    pub(crate) fn apply_to(self, config: &mut AgentConfig) {
        if let Some(v) = self.system_prompt {
            config.system_prompt = v;
        }
        if let Some(v) = self.pipeline_type {
            config.pipeline_type = v;
        }
        if let Some(v) = self.llm_model {
            config.llm_model = v;
        }
        if let Some(v) = self.stt_model {
            config.stt_model = v;
        }
        if let Some(v) = self.tts_model {
            config.tts_model = v;
        }
        if let Some(v) = self.voice {
            config.voice = v;
        }
        if let Some(v) = self.language {
            config.language = v;
        }
        if let Some(v) = self.speech_rate {
            config.speech_rate = v;
        }
        // Credentials merge per provider; everything else is replaced.
        if let Some(keys) = self.api_keys {
            config.api_keys.extend(keys);
        }
    }
}
