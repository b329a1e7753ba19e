//! Text-to-speech client
//!
//! Two request shapes are supported: a JSON request naming a voice that lives
//! on the speech server, and a multipart upload carrying a local reference
//! voice for cloning.

use super::artifacts::{
    artifact_filename, decode_media_base64, filename_snippet, Artifact, ArtifactStore,
};
use super::{api_error, network_error};
use crate::messages::UserId;
use crate::{Result, TangError};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Configuration for the speech generation service
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TTSConfig {
    /// Service base URL, without trailing slash
    pub api_base: String,

    /// Voice path on the speech server, used when no reference voice is given
    pub default_voice: String,

    /// Emotion blend strength passed through to the service
    pub emo_alpha: f32,

    /// Synthesis timeout in seconds
    pub timeout_secs: u64,
}

impl Default for TTSConfig {
    fn default() -> Self {
        Self {
            api_base: "https://game.agaii.org/tts2".to_string(),
            default_voice: "examples/prompt1.wav".to_string(),
            emo_alpha: 1.0,
            timeout_secs: 300,
        }
    }
}

impl TTSConfig {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            ..Default::default()
        }
    }

    pub fn with_default_voice(mut self, voice: impl Into<String>) -> Self {
        self.default_voice = voice.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_base.is_empty() {
            return Err(TangError::ConfigError("TTS api_base must not be empty".into()));
        }
        if self.default_voice.is_empty() {
            return Err(TangError::ConfigError("TTS default_voice must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    speaker_audio_path: &'a str,
    emo_alpha: f32,
    return_raw_audio: bool,
}

#[derive(Deserialize)]
struct SpeechResponse {
    #[serde(default)]
    success: bool,
    audio_base64: Option<String>,
    error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SpeechClient {
    config: TTSConfig,
    http: reqwest::Client,
    store: ArtifactStore,
}

impl SpeechClient {
    pub fn new(config: TTSConfig, http: reqwest::Client, store: ArtifactStore) -> Self {
        Self {
            config,
            http,
            store,
        }
    }

    pub fn config(&self) -> &TTSConfig {
        &self.config
    }

    /// Synthesize `text` for `owner`, cloning `voice` when one is given
    pub async fn generate(
        &self,
        text: &str,
        owner: UserId,
        voice: Option<&Path>,
    ) -> Result<Artifact> {
        let audio = match voice {
            Some(path) => self.synthesize_with_upload(text, path).await?,
            None => self.synthesize(text).await?,
        };

        let filename = artifact_filename("tts", &filename_snippet(text, 20, usize::MAX), "wav");
        let artifact = self.store.save(owner, &filename, &audio).await?;
        debug!("Speech generated ({} bytes): {}", audio.len(), artifact.url);
        Ok(artifact)
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let url = format!("{}/tts", self.config.api_base);
        info!("Requesting speech with voice {} from {}", self.config.default_voice, url);

        let response = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&SpeechRequest {
                text,
                speaker_audio_path: &self.config.default_voice,
                emo_alpha: self.config.emo_alpha,
                return_raw_audio: false,
            })
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status, &body));
        }

        let body: SpeechResponse = response
            .json()
            .await
            .map_err(|e| TangError::GenerationError(format!("Invalid TTS response: {}", e)))?;

        if !body.success {
            return Err(TangError::GenerationError(
                body.error.unwrap_or_else(|| "Unknown TTS error".to_string()),
            ));
        }

        match body.audio_base64.filter(|s| !s.is_empty()) {
            Some(encoded) => decode_media_base64(&encoded),
            None => Err(TangError::GenerationError(
                "No audio data in response".to_string(),
            )),
        }
    }

    async fn synthesize_with_upload(&self, text: &str, voice: &Path) -> Result<Vec<u8>> {
        let voice_bytes = tokio::fs::read(voice).await.map_err(|_| {
            TangError::GenerationError(format!("Voice file not found: {}", voice.display()))
        })?;

        let url = format!("{}/tts/upload", self.config.api_base);
        info!("Uploading reference voice {} to {}", voice.display(), url);

        let speaker = Part::bytes(voice_bytes)
            .file_name("speaker.wav")
            .mime_str("audio/wav")
            .map_err(network_error)?;
        let form = Form::new()
            .text("text", text.to_string())
            .text("emo_alpha", format!("{:.1}", self.config.emo_alpha))
            .part("speaker_audio", speaker);

        let response = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .multipart(form)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status, &body));
        }

        let audio = response.bytes().await.map_err(network_error)?;
        Ok(audio.to_vec())
    }
}
