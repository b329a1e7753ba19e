//! Wire events sent to the chat client

use crate::directive::{DirectiveKind, FilterEvent};
use serde::{Deserialize, Serialize};

/// One server-sent event of a chat response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// Visible text
    Content { content: String },

    ImageGenerated { url: String, prompt: String },

    AudioGenerated { url: String, text: String },

    /// Annotated copy of an input image; kept for client compatibility
    Annotation { url: String },

    /// The response was stored
    Done {
        message_id: i64,
        conversation_id: i64,
        title: String,
    },

    Error { error: String },
}

impl ChatEvent {
    /// Wire form of a filter event; dispatch and terminal events have none
    pub fn from_filter(event: &FilterEvent) -> Option<Self> {
        match event {
            FilterEvent::Display(text) => Some(ChatEvent::Content {
                content: text.clone(),
            }),
            FilterEvent::Artifact {
                kind: DirectiveKind::Image,
                url,
                argument,
            } => Some(ChatEvent::ImageGenerated {
                url: url.clone(),
                prompt: argument.clone(),
            }),
            FilterEvent::Artifact {
                kind: DirectiveKind::Speech,
                url,
                argument,
            } => Some(ChatEvent::AudioGenerated {
                url: url.clone(),
                text: argument.clone(),
            }),
            FilterEvent::Dispatch(_) | FilterEvent::Terminal { .. } => None,
        }
    }

    pub fn to_json(&self) -> String {
        // Plain enum of strings and integers; serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Whether the event carries a generated artifact
    pub fn is_artifact(&self) -> bool {
        matches!(
            self,
            ChatEvent::ImageGenerated { .. } | ChatEvent::AudioGenerated { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let event = ChatEvent::Content {
            content: "hi".into(),
        };
        assert_eq!(event.to_json(), "{\"type\":\"content\",\"content\":\"hi\"}");

        let done = ChatEvent::Done {
            message_id: 4,
            conversation_id: 2,
            title: "New Chat".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&done.to_json()).unwrap();
        assert_eq!(value["type"], "done");
        assert_eq!(value["message_id"], 4);
    }

    #[test]
    fn test_from_filter_event() {
        let image = FilterEvent::Artifact {
            kind: DirectiveKind::Image,
            url: "/api/files/1/a.png".into(),
            argument: "a cat".into(),
        };
        assert_eq!(
            ChatEvent::from_filter(&image),
            Some(ChatEvent::ImageGenerated {
                url: "/api/files/1/a.png".into(),
                prompt: "a cat".into()
            })
        );

        let speech = FilterEvent::Artifact {
            kind: DirectiveKind::Speech,
            url: "/api/files/1/a.wav".into(),
            argument: "hello world out loud".into(),
        };
        let event = ChatEvent::from_filter(&speech).unwrap();
        assert!(event.is_artifact());
        assert!(event.to_json().contains("\"type\":\"audio_generated\""));

        let terminal = FilterEvent::Terminal {
            persisted: String::new(),
            error: None,
        };
        assert!(ChatEvent::from_filter(&terminal).is_none());
    }
}
