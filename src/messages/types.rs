use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Numeric identity of an authenticated caller
pub type UserId = i64;

/// Title every conversation starts with
pub const DEFAULT_TITLE: &str = "New Chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// Media attached to a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

/// A media reference carried alongside message text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: MediaKind,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub owner: UserId,
    pub title: String,
    pub message_count: usize,
    /// Conversation this one was branched from
    #[serde(default)]
    pub parent_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: i64, owner: UserId) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner,
            title: DEFAULT_TITLE.to_string(),
            message_count: 0,
            parent_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A message as written by the chat turn, before it gets an id
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub media: Option<Attachment>,
    pub model_id: Option<String>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>, media: Option<Attachment>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            media,
            model_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            media: None,
            model_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            media: None,
            model_id: Some(model_id.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub role: Role,
    pub content: String,
    pub media_type: Option<MediaKind>,
    pub media_url: Option<String>,
    pub model_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn attachment(&self) -> Option<Attachment> {
        match (self.media_type, &self.media_url) {
            (Some(kind), Some(url)) => Some(Attachment {
                kind,
                url: url.clone(),
            }),
            _ => None,
        }
    }
}
