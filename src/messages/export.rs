//! Conversation export as Markdown or JSON

use super::types::{Conversation, Role, StoredMessage};
use crate::{Result, TangError};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt::Write;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportFormat {
    #[default]
    Markdown,
    Json,
}

impl FromStr for ExportFormat {
    type Err = TangError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            "json" => Ok(ExportFormat::Json),
            other => Err(TangError::InvalidRequest(format!(
                "unknown export format: {}",
                other
            ))),
        }
    }
}

/// Body of the export response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Export {
    pub format: &'static str,
    pub content: Value,
}

pub fn export(
    conversation: &Conversation,
    messages: &[StoredMessage],
    format: ExportFormat,
) -> Export {
    match format {
        ExportFormat::Markdown => Export {
            format: "markdown",
            content: Value::String(to_markdown(conversation, messages)),
        },
        ExportFormat::Json => Export {
            format: "json",
            content: to_json(conversation, messages),
        },
    }
}

fn heading(role: Role) -> &'static str {
    match role {
        Role::User => "## 👤 User",
        Role::Assistant => "## 🤖 Assistant",
        Role::System => "## ⚙️ System",
    }
}

pub fn to_markdown(conversation: &Conversation, messages: &[StoredMessage]) -> String {
    let mut out = format!(
        "# {}\n\n*Exported from TangLLM*\n\n---\n\n",
        conversation.title
    );

    for message in messages {
        // Writing into a String cannot fail
        let _ = write!(out, "{}\n\n{}\n\n", heading(message.role), message.content);
        if let Some(attachment) = message.attachment() {
            let _ = write!(
                out,
                "*Attached: {} - {}*\n\n",
                attachment.kind.as_str(),
                attachment.url
            );
        }
        out.push_str("---\n\n");
    }
    out
}

pub fn to_json(conversation: &Conversation, messages: &[StoredMessage]) -> Value {
    let messages: Vec<Value> = messages
        .iter()
        .map(|m| {
            json!({
                "role": m.role,
                "content": m.content,
                "media_type": m.media_type,
                "media_url": m.media_url,
                "created_at": m.created_at.to_rfc3339(),
            })
        })
        .collect();

    json!({
        "title": conversation.title,
        "created_at": conversation.created_at.to_rfc3339(),
        "messages": messages,
    })
}
