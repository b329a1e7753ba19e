//! HTTP client for the OpenAI-compatible chat completions API
//!
//! Streams `choices[0].delta.content` fragments out of the server-sent event
//! body. Fragments are passed on exactly as received; the directive filter
//! downstream copes with arbitrary splits.

use super::config::LLMConfig;
use crate::{Result, TangError};
use async_stream::try_stream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Stream of model output fragments
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Per-request sampling options
#[derive(Clone, Debug, PartialEq)]
pub struct ChatOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub enable_thinking: bool,
}

impl ChatOptions {
    pub fn from_config(config: &LLMConfig, enable_thinking: bool) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            enable_thinking,
        }
    }
}

/// Result of a non-streaming completion
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub total_tokens: u64,
    pub generation_time_ms: u64,
}

/// Entry of `GET /models`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default = "unknown_owner")]
    pub owned_by: String,
    #[serde(default)]
    pub created: Option<i64>,
}

fn unknown_owner() -> String {
    "unknown".to_string()
}

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelInfo>,
}

/// One decoded SSE `data:` payload
#[derive(Debug, PartialEq, Eq)]
pub enum SseLine {
    Data(String),
    Done,
}

/// Splits an SSE byte stream into `data:` payloads
///
/// Chunks may end anywhere, including inside a line or a UTF-8 sequence;
/// incomplete input is kept until the next chunk arrives.
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    buffer: Vec<u8>,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every complete payload it finishes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseLine> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim_start();
            if payload == "[DONE]" {
                lines.push(SseLine::Done);
            } else if !payload.is_empty() {
                lines.push(SseLine::Data(payload.to_string()));
            }
        }
        lines
    }
}

/// Extract the content delta of a streaming chunk
fn delta_content(payload: &str) -> Option<String> {
    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => {
            warn!("Skipping undecodable stream chunk: {}", e);
            return None;
        }
    };
    value["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Drive one streaming request, yielding content deltas until `[DONE]`
fn stream_fragments(request: reqwest::RequestBuilder) -> impl Stream<Item = Result<String>> + Send {
    try_stream! {
        let response = request
            .send()
            .await
            .map_err(|e| TangError::UpstreamError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            Err::<(), _>(TangError::UpstreamError(format!(
                "HTTP {}: {}",
                status.as_u16(),
                text.chars().take(200).collect::<String>()
            )))?;
            return;
        }

        let mut bytes = response.bytes_stream();
        let mut decoder = SseLineDecoder::new();
        let mut finished = false;

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| TangError::UpstreamError(e.to_string()))?;
            for line in decoder.push(&chunk) {
                match line {
                    SseLine::Done => {
                        finished = true;
                        break;
                    }
                    SseLine::Data(payload) => {
                        if let Some(content) = delta_content(&payload) {
                            yield content;
                        }
                    }
                }
            }
            if finished {
                break;
            }
        }
        debug!("Upstream stream closed (done marker: {})", finished);
    }
}

#[derive(Clone, Debug)]
pub struct LLMClient {
    config: LLMConfig,
    http: reqwest::Client,
}

impl LLMClient {
    pub fn new(config: LLMConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| TangError::ConfigError(format!("HTTP client: {}", e)))?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &LLMConfig {
        &self.config
    }

    pub fn model_id(&self) -> &str {
        &self.config.model_id
    }

    /// Same connection pool, different endpoint, model or key
    ///
    /// `None` keeps the current value.
    pub fn with_overrides(
        &self,
        api_base: Option<&str>,
        model_id: Option<&str>,
        api_key: Option<&str>,
    ) -> Self {
        let mut config = self.config.clone();
        if let Some(base) = api_base {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(model) = model_id {
            config.model_id = model.to_string();
        }
        if let Some(key) = api_key {
            config.api_key = Some(key.to_string());
        }
        Self {
            config,
            http: self.http.clone(),
        }
    }

    fn request_body(&self, messages: &[Value], options: &ChatOptions, stream: bool) -> Value {
        json!({
            "model": self.config.model_id,
            "messages": messages,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
            "stream": stream,
            "chat_template_kwargs": { "enable_thinking": options.enable_thinking },
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.http.post(format!("{}{}", self.config.api_base, path));
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Start a streaming completion
    ///
    /// Connection and HTTP errors surface as the first stream item.
    pub fn chat_stream(&self, messages: Vec<Value>, options: ChatOptions) -> FragmentStream {
        let body = self.request_body(&messages, &options, true);
        let request = self.post("/chat/completions").json(&body);
        info!(
            "Streaming completion from {} (thinking: {})",
            self.config.model_id, options.enable_thinking
        );

        Box::pin(stream_fragments(request))
    }

    /// Non-streaming completion
    pub async fn complete(&self, messages: Vec<Value>, options: ChatOptions) -> Result<Completion> {
        let started = Instant::now();
        let response = self
            .post("/chat/completions")
            .json(&self.request_body(&messages, &options, false))
            .send()
            .await
            .map_err(|e| TangError::UpstreamError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TangError::UpstreamError(format!(
                "HTTP {}: {}",
                status.as_u16(),
                text.chars().take(200).collect::<String>()
            )));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| TangError::UpstreamError(format!("Invalid completion: {}", e)))?;

        Ok(Completion {
            content: value["choices"][0]["message"]["content"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            total_tokens: value["usage"]["total_tokens"].as_u64().unwrap_or(0),
            generation_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Models offered by the endpoint; failures yield an empty list
    pub async fn list_models(&self) -> Vec<ModelInfo> {
        let mut request = self.http.get(format!("{}/models", self.config.api_base));
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let result = async {
            let response = request.send().await?.error_for_status()?;
            response.json::<ModelList>().await
        }
        .await;

        match result {
            Ok(list) => list.data,
            Err(e) => {
                warn!("Error listing models: {}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> LLMClient {
        LLMClient::new(LLMConfig::new(base, "test-model")).unwrap()
    }

    fn options() -> ChatOptions {
        ChatOptions::from_config(&LLMConfig::default(), false)
    }

    fn sse_body(fragments: &[&str]) -> String {
        let mut body = String::new();
        for fragment in fragments {
            let chunk = json!({ "choices": [{ "delta": { "content": fragment } }] });
            body.push_str(&format!("data: {}\n\n", chunk));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    #[test]
    fn test_decoder_handles_split_lines() {
        let mut decoder = SseLineDecoder::new();
        let body = "data: {\"a\":1}\n\ndata: [DONE]\n\n";

        let mut lines = Vec::new();
        for byte in body.as_bytes().chunks(3) {
            lines.extend(decoder.push(byte));
        }
        assert_eq!(lines, vec![SseLine::Data("{\"a\":1}".into()), SseLine::Done]);
    }

    #[test]
    fn test_decoder_keeps_split_utf8() {
        let mut decoder = SseLineDecoder::new();
        let body = "data: héllo\r\n".as_bytes();

        // Split inside the two-byte 'é'
        assert!(decoder.push(&body[..8]).is_empty());
        assert_eq!(decoder.push(&body[8..]), vec![SseLine::Data("héllo".into())]);
    }

    #[test]
    fn test_decoder_ignores_comments_and_events() {
        let mut decoder = SseLineDecoder::new();
        let lines = decoder.push(b": keep-alive\nevent: ping\ndata:\n");
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn test_chat_stream_yields_deltas() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_body(mockito::Matcher::PartialJson(json!({
                "model": "test-model",
                "stream": true,
                "chat_template_kwargs": { "enable_thinking": false }
            })))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(sse_body(&["Hel", "lo [T2I", "_REQUEST: x]"]))
            .create_async()
            .await;

        let stream = client(&server.url()).chat_stream(vec![], options());
        let fragments: Vec<String> = stream.map(|r| r.unwrap()).collect().await;

        mock.assert_async().await;
        assert_eq!(fragments, vec!["Hel", "lo [T2I", "_REQUEST: x]"]);
    }

    #[tokio::test]
    async fn test_overrides_change_endpoint_and_model() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer user-key")
            .match_body(mockito::Matcher::PartialJson(json!({ "model": "user-model" })))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(sse_body(&["ok"]))
            .create_async()
            .await;

        let base = client("http://127.0.0.1:9");
        let custom = base.with_overrides(
            Some(&format!("{}/", server.url())),
            Some("user-model"),
            Some("user-key"),
        );
        assert_eq!(base.model_id(), "test-model");
        assert_eq!(custom.model_id(), "user-model");

        let fragments: Vec<String> = custom
            .chat_stream(vec![], options())
            .map(|r| r.unwrap())
            .collect()
            .await;
        mock.assert_async().await;
        assert_eq!(fragments, vec!["ok"]);
    }

    #[tokio::test]
    async fn test_chat_stream_http_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let mut stream = client(&server.url()).chat_stream(vec![], options());
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(TangError::UpstreamError(ref m)) if m.contains("502")));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_complete() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(
                json!({
                    "choices": [{ "message": { "content": "Hi!" } }],
                    "usage": { "total_tokens": 12 }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let completion = client(&server.url())
            .complete(vec![], options())
            .await
            .unwrap();
        assert_eq!(completion.content, "Hi!");
        assert_eq!(completion.total_tokens, 12);
    }

    #[tokio::test]
    async fn test_list_models() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/models")
            .with_status(200)
            .with_body(r#"{"data": [{"id": "qwen", "owned_by": "vllm", "created": 1}, {"id": "bare"}]}"#)
            .create_async()
            .await;

        let models = client(&server.url()).list_models().await;
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].owned_by, "vllm");
        assert_eq!(models[1].owned_by, "unknown");
    }

    #[tokio::test]
    async fn test_list_models_failure_is_empty() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/models")
            .with_status(500)
            .create_async()
            .await;

        assert!(client(&server.url()).list_models().await.is_empty());
    }
}
