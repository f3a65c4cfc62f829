//! Configuration types for the dialogue framework.
//!
//! Every module receives an immutable snapshot of this configuration at
//! construction; nothing reads config after startup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemdisConfig {
    /// Message bus settings.
    pub bus: BusConfig,
    /// Voice-activity-projection settings.
    pub vap: VapConfig,
    /// Dialogue controller settings.
    pub dialogue: DialogueConfig,
    /// LLM response generation settings.
    pub chatgpt: ChatGptConfig,
    /// Text-based turn-taking / backchannel inference settings.
    pub text_vap: TextVapConfig,
    /// Silence watchdog settings.
    pub intention: IntentionConfig,
    /// Module runtime settings.
    pub runtime: RuntimeConfig,
}

/// Message bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-subscriber queue capacity before the drop-oldest policy applies.
    pub buff_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { buff_size: 10 }
    }
}

/// Voice-activity-projection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VapConfig {
    /// Turn-shift probability threshold (0.0 - 1.0).
    pub threshold: f64,
    /// Window for reconciling VAP timestamps against ASR activity, in ms.
    /// VAP events older than this relative to the newest ASR IU are stale.
    pub reconcile_window_ms: u64,
    /// Expected VAP emission period in ms; silence beyond twice this
    /// switches the controller to the ASR-COMMIT fallback policy.
    pub expected_period_ms: u64,
}

impl Default for VapConfig {
    fn default() -> Self {
        Self {
            threshold: 0.75,
            reconcile_window_ms: 200,
            expected_period_ms: 500,
        }
    }
}

/// Dialogue controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    /// Number of turns retained in the dialogue history.
    pub history_length: usize,
    /// Deadline for the first LLM token, in seconds.
    pub response_generation_timeout_secs: f64,
    /// User silence before the timeout prompt fires, in seconds.
    pub max_silence_time_secs: f64,
    /// Verbal backchannel phrases, rotated through in order.
    pub backchannels: Vec<String>,
    /// Minimum ASR stability for a partial to count as a barge-in.
    pub barge_in_stability: f64,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            history_length: 5,
            response_generation_timeout_secs: 3.0,
            max_silence_time_secs: 5.0,
            backchannels: vec![
                "Uh-huh.".to_owned(),
                "Okay.".to_owned(),
                "I see.".to_owned(),
            ],
            barge_in_stability: 0.5,
        }
    }
}

/// Response generation (LLM) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatGptConfig {
    /// Base URL of the OpenAI-compatible chat completions server.
    pub api_url: String,
    /// API key; empty for local servers.
    pub api_key: String,
    /// Model name for response generation.
    pub response_generation_model: String,
    /// Model name for text-VAP reaction inference; falls back to
    /// `response_generation_model` when empty.
    pub text_vap_model: String,
    /// Maximum tokens per generated response.
    pub max_tokens: usize,
    /// How many history messages accompany the prompt.
    pub max_message_num_in_context: usize,
    /// Characters that close a speakable chunk.
    pub split_pattern: String,
    /// Prompt template file paths.
    pub prompts: PromptPaths,
}

impl Default for ChatGptConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:11434".to_owned(),
            api_key: String::new(),
            response_generation_model: "gpt-4o-mini".to_owned(),
            text_vap_model: String::new(),
            max_tokens: 64,
            max_message_num_in_context: 3,
            split_pattern: "[,.?!]".to_owned(),
            prompts: PromptPaths::default(),
        }
    }
}

/// Paths of the three externally supplied prompt templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptPaths {
    /// Main response generation template.
    pub resp: Option<PathBuf>,
    /// Backchannel / concept extraction template.
    pub bc: Option<PathBuf>,
    /// Timeout (self-initiated speech) template.
    pub timeout: Option<PathBuf>,
}

/// Text-VAP adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TextVapConfig {
    /// Invoke reaction inference once per this many ASR partials.
    pub text_vap_interval: usize,
    /// Upper bound on verbal backchannels within one user turn.
    pub max_verbal_backchannel_num: usize,
}

impl Default for TextVapConfig {
    fn default() -> Self {
        Self {
            text_vap_interval: 3,
            max_verbal_backchannel_num: 2,
        }
    }
}

/// Silence watchdog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentionConfig {
    /// Consecutive timeout prompts allowed before the cooldown.
    pub max_timeout_num: u32,
    /// Cooldown after the prompt budget is exhausted, in seconds.
    pub block_time_secs: f64,
}

impl Default for IntentionConfig {
    fn default() -> Self {
        Self {
            max_timeout_num: 3,
            block_time_secs: 10.0,
        }
    }
}

/// Module runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// How long shutdown drains queued input before cancelling, in ms.
    pub drain_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 1000,
        }
    }
}

impl RemdisConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| crate::error::RemdisError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values outside their documented ranges.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error naming the offending key.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::RemdisError;

        if !(0.0..=1.0).contains(&self.vap.threshold) {
            return Err(RemdisError::Config(format!(
                "vap.threshold must be in [0, 1], got {}",
                self.vap.threshold
            )));
        }
        if self.dialogue.history_length == 0 {
            return Err(RemdisError::Config(
                "dialogue.history_length must be positive".to_owned(),
            ));
        }
        if self.bus.buff_size == 0 {
            return Err(RemdisError::Config(
                "bus.buff_size must be positive".to_owned(),
            ));
        }
        if self.chatgpt.split_pattern.is_empty() {
            return Err(RemdisError::Config(
                "chatgpt.split_pattern must not be empty".to_owned(),
            ));
        }
        Ok(())
    }

    /// Model name used for text-VAP inference.
    pub fn text_vap_model(&self) -> &str {
        if self.chatgpt.text_vap_model.is_empty() {
            &self.chatgpt.response_generation_model
        } else {
            &self.chatgpt.text_vap_model
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RemdisConfig::default();
        assert_eq!(config.bus.buff_size, 10);
        assert!((config.vap.threshold - 0.75).abs() < f64::EPSILON);
        assert_eq!(config.dialogue.history_length, 5);
        assert!((config.dialogue.max_silence_time_secs - 5.0).abs() < f64::EPSILON);
        assert_eq!(config.text_vap.max_verbal_backchannel_num, 2);
        assert_eq!(config.intention.max_timeout_num, 3);
        assert!((config.intention.block_time_secs - 10.0).abs() < f64::EPSILON);
        assert_eq!(config.dialogue.backchannels.len(), 3);
        config.validate().expect("defaults must validate");
    }

    #[test]
    fn partial_toml_fills_missing_sections() {
        let config: RemdisConfig = toml::from_str(
            r#"
            [vap]
            threshold = 0.6

            [dialogue]
            history_length = 8
            "#,
        )
        .expect("parse");
        assert!((config.vap.threshold - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.dialogue.history_length, 8);
        assert_eq!(config.bus.buff_size, 10);
    }

    #[test]
    fn out_of_range_threshold_rejected() {
        let mut config = RemdisConfig::default();
        config.vap.threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn text_vap_model_falls_back() {
        let mut config = RemdisConfig::default();
        assert_eq!(config.text_vap_model(), "gpt-4o-mini");
        config.chatgpt.text_vap_model = "gpt-4o".to_owned();
        assert_eq!(config.text_vap_model(), "gpt-4o");
    }
}
