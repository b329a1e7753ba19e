//! Conversation context rendering for the chat model
//!
//! Turns stored history plus the new user turn into the OpenAI-compatible
//! `messages` array. Local uploads are inlined as base64 data URIs because the
//! model server cannot reach this backend's file route.

use crate::generation::ArtifactStore;
use crate::messages::{MediaKind, StoredMessage};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use tracing::warn;

/// Kind of a request content part
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartKind {
    Text,
    Image,
    Video,
    Audio,
}

/// One part of a multimodal user message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: PartKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: PartKind::Text,
            text: Some(text.into()),
            url: None,
        }
    }

    pub fn media(kind: PartKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            text: None,
            url: Some(url.into()),
        }
    }
}

/// Total characters of text across the parts
pub fn text_chars(parts: &[ContentPart]) -> usize {
    parts
        .iter()
        .filter_map(|p| p.text.as_deref())
        .map(|t| t.chars().count())
        .sum()
}

/// Everything needed to build one upstream request
#[derive(Clone, Debug)]
pub struct ConversationContext {
    system_prompt: String,
    history: Vec<StoredMessage>,
}

impl ConversationContext {
    /// Create a context keeping at most `max_history` of the newest messages
    pub fn new(
        system_prompt: impl Into<String>,
        mut history: Vec<StoredMessage>,
        max_history: usize,
    ) -> Self {
        if history.len() > max_history {
            history.drain(..history.len() - max_history);
        }
        Self {
            system_prompt: system_prompt.into(),
            history,
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn history(&self) -> &[StoredMessage] {
        &self.history
    }

    /// Render the `messages` array for a new user turn
    pub async fn render(&self, store: &ArtifactStore, new_turn: &[ContentPart]) -> Vec<Value> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);

        if !self.system_prompt.is_empty() {
            messages.push(json!({ "role": "system", "content": self.system_prompt }));
        }

        for message in &self.history {
            messages.push(render_stored(store, message).await);
        }

        let mut parts = Vec::with_capacity(new_turn.len());
        for part in new_turn {
            if let Some(rendered) = render_part(store, part).await {
                parts.push(rendered);
            }
        }

        let content = match parts.len() {
            0 => Value::String(String::new()),
            1 if parts[0]["type"] == "text" => parts[0]["text"].clone(),
            _ => Value::Array(parts),
        };
        messages.push(json!({ "role": "user", "content": content }));

        messages
    }
}

async fn render_stored(store: &ArtifactStore, message: &StoredMessage) -> Value {
    let role = message.role.as_str();

    let Some(attachment) = message.attachment() else {
        return json!({ "role": role, "content": message.content });
    };

    let mut content = Vec::new();
    match attachment.kind {
        MediaKind::Image => content.push(json!({
            "type": "image_url",
            "image_url": { "url": media_url(store, &attachment.url).await }
        })),
        MediaKind::Video => content.push(json!({
            "type": "video_url",
            "video_url": { "url": media_url(store, &attachment.url).await }
        })),
        MediaKind::Audio => {}
    }
    if !message.content.is_empty() {
        content.push(json!({ "type": "text", "text": message.content }));
    }

    json!({ "role": role, "content": content })
}

async fn render_part(store: &ArtifactStore, part: &ContentPart) -> Option<Value> {
    match part.kind {
        PartKind::Text => Some(json!({
            "type": "text",
            "text": part.text.clone().unwrap_or_default()
        })),
        PartKind::Image => {
            let url = part.url.as_deref()?;
            Some(json!({
                "type": "image_url",
                "image_url": { "url": media_url(store, url).await }
            }))
        }
        PartKind::Video => {
            let url = part.url.as_deref()?;
            Some(json!({
                "type": "video_url",
                "video_url": { "url": media_url(store, url).await }
            }))
        }
        // Audio only serves as a voice reference for speech generation
        PartKind::Audio => None,
    }
}

/// Inline a local upload as a data URI, or pass the URL through
async fn media_url(store: &ArtifactStore, url: &str) -> String {
    let Some(path) = store.resolve_url(url) else {
        return url.to_string();
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => format!("data:{};base64,{}", mime_for(&path), STANDARD.encode(bytes)),
        Err(e) => {
            warn!("Failed to read local media {}: {}", path.display(), e);
            url.to_string()
        }
    }
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        _ => "image/png",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Role;
    use chrono::Utc;

    fn stored(id: i64, role: Role, content: &str, media: Option<(MediaKind, &str)>) -> StoredMessage {
        StoredMessage {
            id,
            conversation_id: 1,
            role,
            content: content.to_string(),
            media_type: media.map(|(k, _)| k),
            media_url: media.map(|(_, u)| u.to_string()),
            model_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_single_text_part_collapses_to_string() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let context = ConversationContext::new("sys", Vec::new(), 10);

        let messages = context.render(&store, &[ContentPart::text("hello")]).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], json!({ "role": "system", "content": "sys" }));
        assert_eq!(messages[1], json!({ "role": "user", "content": "hello" }));
    }

    #[tokio::test]
    async fn test_local_image_is_inlined() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        store.save(4, "cat.jpg", b"jpeg").await.unwrap();
        let context = ConversationContext::new("sys", Vec::new(), 10);

        let messages = context
            .render(
                &store,
                &[
                    ContentPart::text("what is this"),
                    ContentPart::media(PartKind::Image, "/api/files/4/cat.jpg"),
                ],
            )
            .await;

        let content = messages[1]["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(
            content[1]["image_url"]["url"],
            format!("data:image/jpeg;base64,{}", STANDARD.encode(b"jpeg"))
        );
    }

    #[tokio::test]
    async fn test_remote_and_missing_urls_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let context = ConversationContext::new("", Vec::new(), 10);

        let messages = context
            .render(
                &store,
                &[ContentPart::media(PartKind::Video, "https://cdn.example.com/v.mp4")],
            )
            .await;

        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0]["content"][0]["video_url"]["url"],
            "https://cdn.example.com/v.mp4"
        );
    }

    #[tokio::test]
    async fn test_history_rendering_and_cap() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let history = vec![
            stored(1, Role::User, "dropped", None),
            stored(2, Role::User, "look", Some((MediaKind::Image, "https://x/a.png"))),
            stored(3, Role::Assistant, "[T2I_REQUEST: a cat]", None),
        ];
        let context = ConversationContext::new("sys", history, 2);
        assert_eq!(context.history().len(), 2);

        let messages = context.render(&store, &[ContentPart::text("next")]).await;
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1]["content"][0]["type"], "image_url");
        assert_eq!(messages[1]["content"][1]["text"], "look");
        assert_eq!(
            messages[2],
            json!({ "role": "assistant", "content": "[T2I_REQUEST: a cat]" })
        );
    }

    #[test]
    fn test_text_chars_counts_text_parts_only() {
        let parts = vec![
            ContentPart::text("héllo"),
            ContentPart::media(PartKind::Audio, "/api/files/1/a.wav"),
        ];
        assert_eq!(text_chars(&parts), 5);
    }
}
