//! Image and speech generation behind a single dispatch seam

pub mod artifacts;
pub mod t2i;
pub mod tts;

pub use artifacts::{Artifact, ArtifactStore};
pub use t2i::{ImageClient, ServiceHealth, T2IConfig};
pub use tts::{SpeechClient, TTSConfig};

use crate::messages::UserId;
use crate::{Result, TangError};
use async_trait::async_trait;
use std::path::Path;

/// Longest slice of an error body quoted back to the user
const ERROR_BODY_CHARS: usize = 200;

/// Executes generation directives
#[async_trait]
pub trait GenerationDispatcher: Send + Sync {
    async fn generate_image(&self, prompt: &str, owner: UserId) -> Result<Artifact>;

    async fn generate_speech(
        &self,
        text: &str,
        owner: UserId,
        voice: Option<&Path>,
    ) -> Result<Artifact>;
}

/// Dispatcher backed by the remote image and speech services
#[derive(Clone, Debug)]
pub struct HttpDispatcher {
    image: ImageClient,
    speech: SpeechClient,
}

impl HttpDispatcher {
    pub fn new(image: ImageClient, speech: SpeechClient) -> Self {
        Self { image, speech }
    }

    pub fn image(&self) -> &ImageClient {
        &self.image
    }
}

#[async_trait]
impl GenerationDispatcher for HttpDispatcher {
    async fn generate_image(&self, prompt: &str, owner: UserId) -> Result<Artifact> {
        self.image.generate(prompt, owner).await
    }

    async fn generate_speech(
        &self,
        text: &str,
        owner: UserId,
        voice: Option<&Path>,
    ) -> Result<Artifact> {
        self.speech.generate(text, owner, voice).await
    }
}

pub(crate) fn network_error(e: reqwest::Error) -> TangError {
    TangError::GenerationError(format!("Network error: {}", e))
}

pub(crate) fn api_error(status: reqwest::StatusCode, body: &str) -> TangError {
    let excerpt: String = body.chars().take(ERROR_BODY_CHARS).collect();
    TangError::GenerationError(format!("API error ({}): {}", status.as_u16(), excerpt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_excerpt() {
        let err = api_error(reqwest::StatusCode::BAD_GATEWAY, &"é".repeat(300));
        let TangError::GenerationError(message) = err else {
            panic!("Expected generation error");
        };
        assert!(message.starts_with("API error (502): "));
        assert_eq!(message.chars().filter(|c| *c == 'é').count(), 200);
    }
}
