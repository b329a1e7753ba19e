//! Configuration for the upstream OpenAI-compatible model endpoint

use crate::{Result, TangError};
use serde::{Deserialize, Serialize};

/// Prompt length above which `auto` mode turns reasoning on
pub const AUTO_THINKING_THRESHOLD: usize = 100;

/// Whether the model should emit a `<think>` block before answering
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingMode {
    /// Reason only for longer prompts
    #[default]
    Auto,
    /// Never reason
    Fast,
    /// Always reason
    Thinking,
}

impl ThinkingMode {
    /// Resolve the mode for a prompt of `text_chars` characters
    pub fn enabled_for(&self, text_chars: usize) -> bool {
        match self {
            ThinkingMode::Fast => false,
            ThinkingMode::Thinking => true,
            ThinkingMode::Auto => text_chars > AUTO_THINKING_THRESHOLD,
        }
    }
}

/// Configuration for the chat model client
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LLMConfig {
    /// Base URL of the OpenAI-compatible API, e.g. `http://host/v1`
    pub api_base: String,

    /// Model identifier sent with every request
    pub model_id: String,

    /// Bearer token; self-hosted servers usually ignore it
    pub api_key: Option<String>,

    /// Temperature for sampling (0.0 = deterministic, 1.0+ = creative)
    pub temperature: f32,

    /// Maximum tokens to generate per response
    pub max_tokens: u32,

    /// Operator prompt placed before the generation instructions
    pub system_prompt: Option<String>,

    pub thinking_mode: ThinkingMode,

    /// Maximum number of history messages sent upstream
    pub max_history: usize,

    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            api_base: "https://game.agaii.org/mllm/v1".to_string(),
            model_id: "Qwen/Qwen3-VL-30B-A3B-Instruct-FP8".to_string(),
            api_key: None,
            temperature: 0.7,
            max_tokens: 4096,
            system_prompt: None,
            thinking_mode: ThinkingMode::Auto,
            max_history: 100,
            connect_timeout_secs: 10,
        }
    }
}

impl LLMConfig {
    /// Create a configuration for the given endpoint and model
    pub fn new(api_base: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            model_id: model_id.into(),
            ..Default::default()
        }
    }

    /// Set the temperature
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set maximum tokens
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_thinking_mode(mut self, mode: ThinkingMode) -> Self {
        self.thinking_mode = mode;
        self
    }

    /// Cap the number of history messages
    pub fn with_max_history(mut self, max: usize) -> Self {
        self.max_history = max;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_base.is_empty() {
            return Err(TangError::ConfigError("LLM api_base must not be empty".into()));
        }
        if self.model_id.is_empty() {
            return Err(TangError::ConfigError("LLM model_id must not be empty".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(TangError::ConfigError(format!(
                "LLM temperature {} is outside 0.0..=2.0",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(TangError::ConfigError("LLM max_tokens must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LLMConfig::default();
        assert_eq!(config.model_id, "Qwen/Qwen3-VL-30B-A3B-Instruct-FP8");
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.max_tokens, 4096);
        assert_eq!(config.thinking_mode, ThinkingMode::Auto);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = LLMConfig::new("http://localhost:8000/v1", "local-model")
            .with_temperature(0.2)
            .with_max_tokens(512)
            .with_thinking_mode(ThinkingMode::Fast);

        assert_eq!(config.api_base, "http://localhost:8000/v1");
        assert_eq!(config.temperature, 0.2);
        assert_eq!(config.max_tokens, 512);
        assert_eq!(config.thinking_mode, ThinkingMode::Fast);
    }

    #[test]
    fn test_thinking_mode_resolution() {
        assert!(!ThinkingMode::Fast.enabled_for(5000));
        assert!(ThinkingMode::Thinking.enabled_for(0));
        assert!(!ThinkingMode::Auto.enabled_for(100));
        assert!(ThinkingMode::Auto.enabled_for(101));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(LLMConfig::default().with_temperature(3.0).validate().is_err());
        assert!(LLMConfig::default().with_max_tokens(0).validate().is_err());
        assert!(LLMConfig::new("", "m").validate().is_err());
    }
}
