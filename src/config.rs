//! Application configuration
//!
//! Defaults are compiled in; an optional TOML file (path in `TANGLLM_CONFIG`)
//! overrides them, and `TANGLLM_*` environment variables override the file.

use crate::directive::FilterConfig;
use crate::generation::{T2IConfig, TTSConfig};
use crate::llm::{LLMConfig, ThinkingMode};
use crate::{Result, TangError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming the TOML configuration file
pub const CONFIG_PATH_ENV: &str = "TANGLLM_CONFIG";

/// HTTP listener settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Allowed CORS origins; empty allows any origin
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6666,
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| TangError::ConfigError(format!("Invalid listen address: {}", e)))
    }
}

/// File storage settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of uploaded and generated files
    pub upload_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
        }
    }
}

/// Configuration for the complete backend
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub llm: LLMConfig,
    pub t2i: T2IConfig,
    pub tts: TTSConfig,
    pub storage: StorageConfig,
    pub filter: FilterConfig,
}

impl AppConfig {
    /// Parse a TOML document; missing sections keep their defaults
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| TangError::ConfigError(format!("Invalid TOML: {}", e)))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TangError::ConfigError(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    /// Load `.env`, the optional config file and environment overrides
    pub fn load() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!("Loaded environment from {}", path.display());
        }

        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => {
                info!("Loading configuration from {}", path);
                Self::from_file(Path::new(&path))?
            }
            Err(_) => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TANGLLM_*` overrides using `lookup` to read variables
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TANGLLM_HOST") {
            self.server.host = v;
        }
        if let Some(v) = lookup("TANGLLM_PORT") {
            self.server.port = parse_var("TANGLLM_PORT", &v)?;
        }
        if let Some(v) = lookup("TANGLLM_API_BASE") {
            self.llm.api_base = v;
        }
        if let Some(v) = lookup("TANGLLM_MODEL_ID") {
            self.llm.model_id = v;
        }
        if let Some(v) = lookup("TANGLLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = lookup("TANGLLM_SYSTEM_PROMPT") {
            self.llm.system_prompt = Some(v);
        }
        if let Some(v) = lookup("TANGLLM_THINKING_MODE") {
            self.llm.thinking_mode = match v.to_ascii_lowercase().as_str() {
                "auto" => ThinkingMode::Auto,
                "fast" => ThinkingMode::Fast,
                "thinking" => ThinkingMode::Thinking,
                other => {
                    return Err(TangError::ConfigError(format!(
                        "TANGLLM_THINKING_MODE must be auto, fast or thinking, got {:?}",
                        other
                    )))
                }
            };
        }
        if let Some(v) = lookup("TANGLLM_T2I_API_BASE") {
            self.t2i.api_base = v;
        }
        if let Some(v) = lookup("TANGLLM_TTS_API_BASE") {
            self.tts.api_base = v;
        }
        if let Some(v) = lookup("TANGLLM_TTS_DEFAULT_VOICE") {
            self.tts.default_voice = v;
        }
        if let Some(v) = lookup("TANGLLM_UPLOAD_DIR") {
            self.storage.upload_dir = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.server.socket_addr()?;
        self.llm.validate()?;
        self.t2i.validate()?;
        self.tts.validate()?;
        self.filter.validate()?;
        if self.storage.upload_dir.as_os_str().is_empty() {
            return Err(TangError::ConfigError("upload_dir must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| TangError::ConfigError(format!("{}: {}", key, e)))
}
