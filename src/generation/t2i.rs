//! Text-to-image client
//!
//! Talks to the image generation service (`POST {base}/generate`) and stores
//! the returned PNG through the artifact store.

use super::artifacts::{
    artifact_filename, decode_media_base64, filename_snippet, Artifact, ArtifactStore,
};
use super::{api_error, network_error};
use crate::messages::UserId;
use crate::{Result, TangError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Configuration for the image generation service
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct T2IConfig {
    /// Service base URL, without trailing slash
    pub api_base: String,

    pub width: u32,
    pub height: u32,

    /// Diffusion steps per image
    pub num_inference_steps: u32,

    /// Generation timeout in seconds
    pub timeout_secs: u64,

    /// Health check timeout in seconds
    pub health_timeout_secs: u64,
}

impl Default for T2IConfig {
    fn default() -> Self {
        Self {
            api_base: "https://game.agaii.org/t2i".to_string(),
            width: 1024,
            height: 1024,
            num_inference_steps: 9,
            timeout_secs: 600,
            health_timeout_secs: 5,
        }
    }
}

impl T2IConfig {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.num_inference_steps = steps;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_base.is_empty() {
            return Err(TangError::ConfigError("T2I api_base must not be empty".into()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(TangError::ConfigError("T2I image size must be non-zero".into()));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    width: u32,
    height: u32,
    num_inference_steps: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    image_base64: Option<String>,
    #[serde(default)]
    generation_time_ms: Option<u64>,
}

/// Result of the image service health check
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub gpu_available: bool,
    #[serde(default)]
    pub queue_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Deserialize)]
struct HealthResponse {
    status: Option<String>,
    #[serde(default)]
    gpu_available: bool,
    #[serde(default)]
    queue_size: u64,
}

#[derive(Clone, Debug)]
pub struct ImageClient {
    config: T2IConfig,
    http: reqwest::Client,
    store: ArtifactStore,
}

impl ImageClient {
    pub fn new(config: T2IConfig, http: reqwest::Client, store: ArtifactStore) -> Self {
        Self {
            config,
            http,
            store,
        }
    }

    pub fn config(&self) -> &T2IConfig {
        &self.config
    }

    /// Generate an image for `prompt` and store it for `owner`
    pub async fn generate(&self, prompt: &str, owner: UserId) -> Result<Artifact> {
        let url = format!("{}/generate", self.config.api_base);
        info!("Requesting image ({}x{}) from {}", self.config.width, self.config.height, url);

        let response = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&GenerateRequest {
                prompt,
                width: self.config.width,
                height: self.config.height,
                num_inference_steps: self.config.num_inference_steps,
            })
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status, &body));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| TangError::GenerationError(format!("Invalid T2I response: {}", e)))?;

        let Some(encoded) = body.image_base64.filter(|s| !s.is_empty()) else {
            return Err(TangError::GenerationError(
                "No image data in response".to_string(),
            ));
        };

        let bytes = decode_media_base64(&encoded)?;
        let filename = artifact_filename("t2i", &filename_snippet(prompt, 30, 20), "png");
        let artifact = self.store.save(owner, &filename, &bytes).await?;

        debug!(
            "Image generated in {} ms: {}",
            body.generation_time_ms.unwrap_or(0),
            artifact.url
        );
        Ok(artifact)
    }

    /// Check `GET {base}/health`; failures are reported, never raised
    pub async fn check_health(&self) -> ServiceHealth {
        let url = format!("{}/health", self.config.api_base);
        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(self.config.health_timeout_secs))
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                return ServiceHealth {
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

        if !response.status().is_success() {
            return ServiceHealth {
                error: Some(format!("HTTP {}", response.status().as_u16())),
                ..Default::default()
            };
        }

        match response.json::<HealthResponse>().await {
            Ok(health) => ServiceHealth {
                available: true,
                status: Some(health.status.unwrap_or_else(|| "unknown".to_string())),
                gpu_available: health.gpu_available,
                queue_size: health.queue_size,
                error: None,
            },
            Err(e) => ServiceHealth {
                error: Some(e.to_string()),
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    fn client(base: String, dir: &std::path::Path) -> ImageClient {
        ImageClient::new(
            T2IConfig::new(base),
            reqwest::Client::new(),
            ArtifactStore::new(dir).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_generate_saves_png() {
        let mut server = mockito::Server::new_async().await;
        let encoded = STANDARD.encode(b"fake png");
        let mock = server
            .mock("POST", "/generate")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "prompt": "a red fox",
                "width": 1024,
                "height": 1024,
                "num_inference_steps": 9
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(serde_json::json!({ "image_base64": encoded }).to_string())
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let artifact = client(server.url(), dir.path())
            .generate("a red fox", 5)
            .await
            .unwrap();

        mock.assert_async().await;
        assert!(artifact.url.starts_with("/api/files/5/t2i_"));
        assert!(artifact.url.ends_with(".png"));
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"fake png");
    }

    #[tokio::test]
    async fn test_generate_reports_api_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/generate")
            .with_status(503)
            .with_body("queue full")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let err = client(server.url(), dir.path())
            .generate("a red fox", 5)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Generation error: API error (503): queue full");
    }

    #[tokio::test]
    async fn test_generate_without_image_data() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/generate")
            .with_status(200)
            .with_body(r#"{"status": "ok"}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let err = client(server.url(), dir.path())
            .generate("a red fox", 5)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No image data"));
    }

    #[tokio::test]
    async fn test_health_check() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/health")
            .with_status(200)
            .with_body(r#"{"status": "healthy", "gpu_available": true, "queue_size": 2}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let health = client(server.url(), dir.path()).check_health().await;
        assert!(health.available);
        assert_eq!(health.status.as_deref(), Some("healthy"));
        assert!(health.gpu_available);
        assert_eq!(health.queue_size, 2);
    }

    #[tokio::test]
    async fn test_health_check_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/health")
            .with_status(500)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let health = client(server.url(), dir.path()).check_health().await;
        assert!(!health.available);
        assert_eq!(health.error.as_deref(), Some("HTTP 500"));
    }
}
