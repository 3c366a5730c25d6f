//! [`AgentConfig`]: the document a worker run is launched with.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ValidationError;

pub const MIN_SPEECH_RATE: f32 = 0.5;
pub const MAX_SPEECH_RATE: f32 = 2.0;

/// How the worker assembles its voice pipeline.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    /// One speech-to-speech model handles the whole turn.
    #[default]
    Realtime,
    /// Separate speech-to-text, language model and text-to-speech stages.
    Cascading,
}

impl PipelineMode {
    pub const ALL: [PipelineMode; 2] = [PipelineMode::Realtime, PipelineMode::Cascading];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineMode::Realtime => "realtime",
            PipelineMode::Cascading => "cascading",
        }
    }
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "realtime" => Ok(PipelineMode::Realtime),
            "cascading" => Ok(PipelineMode::Cascading),
            other => Err(ValidationError::UnknownPipeline(other.to_string())),
        }
    }
}

/// The full agent configuration. Every field has a default.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub system_prompt: String,
    pub pipeline_type: PipelineMode,
    /// Language model, or the single speech-to-speech model in realtime mode.
    pub llm_model: String,
    pub stt_model: String,
    pub tts_model: String,
    pub voice: String,
    pub language: String,
    pub speech_rate: f32,
    /// Provider name -> secret credential.
    pub api_keys: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful AI assistant.".to_string(),
            pipeline_type: PipelineMode::Realtime,
            llm_model: "gpt-4o-realtime-preview".to_string(),
            stt_model: "whisper-1".to_string(),
            tts_model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            language: "en".to_string(),
            speech_rate: 1.0,
            api_keys: BTreeMap::new(),
        }
    }
}

// Credentials never show up in logs.
impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("system_prompt", &self.system_prompt)
            .field("pipeline_type", &self.pipeline_type)
            .field("llm_model", &self.llm_model)
            .field("stt_model", &self.stt_model)
            .field("tts_model", &self.tts_model)
            .field("voice", &self.voice)
            .field("language", &self.language)
            .field("speech_rate", &self.speech_rate)
            .field("api_keys", &redact(&self.api_keys))
            .finish()
    }
}

impl AgentConfig {
    /// Serialize the document into the single argument handed to a worker.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Environment variables carrying the non-empty credentials, e.g.
    /// `openai` -> `OPENAI_API_KEY`.
    pub fn credential_env(&self) -> Vec<(String, String)> {
        self.api_keys
            .iter()
            .filter(|(_, key)| !key.is_empty())
            .map(|(provider, key)| (credential_env_var(provider), key.clone()))
            .collect()
    }
}

/// Environment variable name for a provider's credential.
pub fn credential_env_var(provider: &str) -> String {
    let stem: String = provider
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{stem}_API_KEY")
}

pub(crate) fn redact(keys: &BTreeMap<String, String>) -> BTreeMap<&str, &'static str> {
    keys.iter()
        .map(|(provider, key)| (provider.as_str(), if key.is_empty() { "" } else { "***" }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AgentConfig::default();
        assert_eq!(config.pipeline_type, PipelineMode::Realtime);
        assert_eq!(PipelineMode::default(), PipelineMode::Realtime);
        assert_eq!(config.llm_model, "gpt-4o-realtime-preview");
        assert_eq!(config.voice, "alloy");
        assert_eq!(config.speech_rate, 1.0);
        assert!(config.api_keys.is_empty());
    }

    #[test]
    fn pipeline_mode_parses_and_displays() {
        assert_eq!("realtime".parse::<PipelineMode>().unwrap(), PipelineMode::Realtime);
        assert_eq!("cascading".parse::<PipelineMode>().unwrap(), PipelineMode::Cascading);
        assert_eq!(PipelineMode::Cascading.to_string(), "cascading");
        assert_eq!(
            "batch".parse::<PipelineMode>().unwrap_err(),
            ValidationError::UnknownPipeline("batch".to_string())
        );
    }

    #[test]
    fn serializes_with_snake_case_mode() {
        let json = serde_json::to_value(AgentConfig::default()).unwrap();
        assert_eq!(json["pipeline_type"], "realtime");
        assert_eq!(json["api_keys"], serde_json::json!({}));
    }

    #[test]
    fn credential_env_skips_empty_keys() {
        let mut config = AgentConfig::default();
        config.api_keys.insert("openai".to_string(), "sk-1".to_string());
        config.api_keys.insert("deepgram".to_string(), String::new());
        config.api_keys.insert("eleven-labs".to_string(), "el".to_string());

        let env = config.credential_env();
        assert_eq!(
            env,
            vec![
                ("ELEVEN_LABS_API_KEY".to_string(), "el".to_string()),
                ("OPENAI_API_KEY".to_string(), "sk-1".to_string()),
            ]
        );
    }

    #[test]
    fn debug_output_redacts_credentials() {
        let mut config = AgentConfig::default();
        config.api_keys.insert("openai".to_string(), "sk-secret".to_string());
        let debug = format!("{config:?}");
        assert!(debug.contains("openai"));
        assert!(!debug.contains("sk-secret"));
    }
}
