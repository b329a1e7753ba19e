//! Per-user preferences applied to every chat turn
//!
//! Unset endpoint fields fall back to the server's model configuration at
//! request time, so changing the server defaults reaches every user who has
//! not overridden them.

use super::types::UserId;
use crate::llm::{LLMConfig, ThinkingMode};
use crate::{Result, TangError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Upper bound of the sampling temperature
pub const MAX_TEMPERATURE: f32 = 2.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSettings {
    pub user_id: UserId,
    pub api_base_url: Option<String>,
    pub model_id: Option<String>,
    /// Never echoed back to the client
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub theme: String,
    pub enable_voice: bool,
    pub enable_sounds: bool,
    pub show_thinking: bool,
    pub thinking_mode: ThinkingMode,
}

impl UserSettings {
    /// Defaults seeded from the server's model configuration
    pub fn from_config(config: &LLMConfig) -> Self {
        Self {
            user_id: 0,
            api_base_url: None,
            model_id: None,
            api_key: None,
            system_prompt: None,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            theme: "dark".to_string(),
            enable_voice: true,
            enable_sounds: true,
            show_thinking: true,
            thinking_mode: config.thinking_mode,
        }
    }
}

/// Body of `PUT /api/settings`; absent fields are left alone
///
/// An empty string clears a text override.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SettingsUpdate {
    pub api_base_url: Option<String>,
    pub model_id: Option<String>,
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub theme: Option<String>,
    pub enable_voice: Option<bool>,
    pub enable_sounds: Option<bool>,
    pub show_thinking: Option<bool>,
    pub thinking_mode: Option<ThinkingMode>,
}

fn set_text(field: &mut Option<String>, value: Option<String>) {
    if let Some(value) = value {
        let value = value.trim();
        *field = (!value.is_empty()).then(|| value.to_string());
    }
}

impl SettingsUpdate {
    /// Check ranges before anything is written
    pub fn validate(&self) -> Result<()> {
        if let Some(t) = self.temperature {
            if !(0.0..=MAX_TEMPERATURE).contains(&t) {
                return Err(TangError::InvalidRequest(format!(
                    "temperature must be between 0 and {}",
                    MAX_TEMPERATURE
                )));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(TangError::InvalidRequest(
                "max_tokens must be positive".into(),
            ));
        }
        if let Some(url) = self.api_base_url.as_deref().map(str::trim) {
            if !url.is_empty() && !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(TangError::InvalidRequest(
                    "api_base_url must be an http(s) URL".into(),
                ));
            }
        }
        if self.theme.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(TangError::InvalidRequest("theme must not be empty".into()));
        }
        Ok(())
    }

    fn apply(self, settings: &mut UserSettings) {
        set_text(&mut settings.api_base_url, self.api_base_url);
        set_text(&mut settings.model_id, self.model_id);
        set_text(&mut settings.api_key, self.api_key);
        set_text(&mut settings.system_prompt, self.system_prompt);

        if let Some(temperature) = self.temperature {
            settings.temperature = temperature;
        }
        if let Some(max_tokens) = self.max_tokens {
            settings.max_tokens = max_tokens;
        }
        if let Some(theme) = self.theme {
            settings.theme = theme.trim().to_string();
        }
        if let Some(enabled) = self.enable_voice {
            settings.enable_voice = enabled;
        }
        if let Some(enabled) = self.enable_sounds {
            settings.enable_sounds = enabled;
        }
        if let Some(show) = self.show_thinking {
            settings.show_thinking = show;
        }
        if let Some(mode) = self.thinking_mode {
            settings.thinking_mode = mode;
        }
    }
}

/// Settings of every user, created lazily from shared defaults
#[derive(Debug, Clone)]
pub struct SettingsStore {
    users: Arc<RwLock<HashMap<UserId, UserSettings>>>,
    defaults: Arc<UserSettings>,
}

impl SettingsStore {
    pub fn new(defaults: UserSettings) -> Self {
        Self {
            users: Arc::new(RwLock::new(HashMap::new())),
            defaults: Arc::new(defaults),
        }
    }

    pub fn from_config(config: &LLMConfig) -> Self {
        Self::new(UserSettings::from_config(config))
    }

    fn defaults_for(&self, owner: UserId) -> UserSettings {
        UserSettings {
            user_id: owner,
            ..(*self.defaults).clone()
        }
    }

    pub fn get(&self, owner: UserId) -> UserSettings {
        self.users
            .read()
            .get(&owner)
            .cloned()
            .unwrap_or_else(|| self.defaults_for(owner))
    }

    pub fn update(&self, owner: UserId, update: SettingsUpdate) -> Result<UserSettings> {
        update.validate()?;

        let mut users = self.users.write();
        let settings = users
            .entry(owner)
            .or_insert_with(|| self.defaults_for(owner));
        update.apply(settings);
        debug!("Updated settings of user {}", owner);
        Ok(settings.clone())
    }

    pub fn reset(&self, owner: UserId) -> UserSettings {
        let settings = self.defaults_for(owner);
        self.users.write().insert(owner, settings.clone());
        info!("Reset settings of user {}", owner);
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SettingsStore {
        SettingsStore::from_config(&LLMConfig::default().with_temperature(0.5))
    }

    #[test]
    fn test_unknown_user_gets_defaults() {
        let settings = store().get(3);
        assert_eq!(settings.user_id, 3);
        assert_eq!(settings.temperature, 0.5);
        assert_eq!(settings.thinking_mode, ThinkingMode::Auto);
        assert!(settings.system_prompt.is_none());
    }

    #[test]
    fn test_update_is_partial_and_per_user() {
        let store = store();
        let updated = store
            .update(
                3,
                SettingsUpdate {
                    system_prompt: Some("Be brief.".into()),
                    thinking_mode: Some(ThinkingMode::Fast),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.system_prompt.as_deref(), Some("Be brief."));
        assert_eq!(updated.temperature, 0.5);

        let updated = store
            .update(
                3,
                SettingsUpdate {
                    temperature: Some(1.2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.system_prompt.as_deref(), Some("Be brief."));
        assert_eq!(updated.thinking_mode, ThinkingMode::Fast);
        assert_eq!(updated.temperature, 1.2);

        assert!(store.get(4).system_prompt.is_none());
    }

    #[test]
    fn test_empty_string_clears_override() {
        let store = store();
        store
            .update(
                1,
                SettingsUpdate {
                    model_id: Some("other-model".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        let updated = store
            .update(
                1,
                SettingsUpdate {
                    model_id: Some("  ".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(updated.model_id.is_none());
    }

    #[test]
    fn test_invalid_update_changes_nothing() {
        let store = store();
        for update in [
            SettingsUpdate {
                temperature: Some(2.5),
                ..Default::default()
            },
            SettingsUpdate {
                max_tokens: Some(0),
                ..Default::default()
            },
            SettingsUpdate {
                api_base_url: Some("ftp://model".into()),
                system_prompt: Some("ignored".into()),
                ..Default::default()
            },
        ] {
            assert!(matches!(
                store.update(2, update),
                Err(TangError::InvalidRequest(_))
            ));
        }
        assert!(store.get(2).system_prompt.is_none());
    }

    #[test]
    fn test_reset_restores_defaults() {
        let store = store();
        store
            .update(
                5,
                SettingsUpdate {
                    theme: Some("light".into()),
                    api_key: Some("secret".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let reset = store.reset(5);
        assert_eq!(reset.theme, "dark");
        assert!(reset.api_key.is_none());
        assert_eq!(store.get(5), reset);
    }

    #[test]
    fn test_api_key_is_not_serialized() {
        let store = store();
        let settings = store
            .update(
                1,
                SettingsUpdate {
                    api_key: Some("secret".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        let json = serde_json::to_value(&settings).unwrap();
        assert!(json.get("api_key").is_none());
        assert_eq!(json["thinking_mode"], "auto");
    }
}
