use super::types::{Conversation, NewMessage, StoredMessage, UserId};
use crate::{Result, TangError};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Longest title a client may set
pub const MAX_TITLE_CHARS: usize = 200;

#[derive(Debug, Default)]
struct StoreInner {
    conversations: HashMap<i64, Conversation>,
    messages: Vec<StoredMessage>,
    next_conversation_id: i64,
    next_message_id: i64,
}

/// In-process conversation store shared between requests
#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty conversation for `owner`
    pub fn create(&self, owner: UserId) -> Conversation {
        let mut inner = self.inner.write();
        inner.next_conversation_id += 1;
        let conversation = Conversation::new(inner.next_conversation_id, owner);
        inner
            .conversations
            .insert(conversation.id, conversation.clone());
        debug!("Created conversation {} for user {}", conversation.id, owner);
        conversation
    }

    /// Create a conversation with an optional title and system message
    pub fn create_with(
        &self,
        owner: UserId,
        title: Option<&str>,
        system_prompt: Option<&str>,
    ) -> Result<Conversation> {
        let title = title.map(validate_title).transpose()?;

        let mut conversation = self.create(owner);
        if let Some(title) = title {
            conversation = self.rename(conversation.id, owner, &title)?;
        }
        if let Some(prompt) = system_prompt.map(str::trim).filter(|p| !p.is_empty()) {
            self.append(conversation.id, NewMessage::system(prompt))?;
            let mut inner = self.inner.write();
            if let Some(stored) = inner.conversations.get_mut(&conversation.id) {
                stored.message_count = 1;
                conversation = stored.clone();
            }
        }
        Ok(conversation)
    }

    /// Fetch a conversation, hiding ones that belong to someone else
    pub fn get(&self, id: i64, owner: UserId) -> Result<Conversation> {
        self.inner
            .read()
            .conversations
            .get(&id)
            .filter(|c| c.owner == owner)
            .cloned()
            .ok_or_else(|| TangError::NotFound("Conversation".into()))
    }

    /// Conversations of `owner`, most recently updated first
    pub fn list(&self, owner: UserId) -> Vec<Conversation> {
        let mut conversations: Vec<Conversation> = self
            .inner
            .read()
            .conversations
            .values()
            .filter(|c| c.owner == owner)
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        conversations
    }

    /// Messages of a conversation in creation order
    pub fn history(&self, conversation_id: i64, owner: UserId) -> Result<Vec<StoredMessage>> {
        self.get(conversation_id, owner)?;
        Ok(self
            .inner
            .read()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    pub fn append(&self, conversation_id: i64, message: NewMessage) -> Result<StoredMessage> {
        let mut inner = self.inner.write();
        if !inner.conversations.contains_key(&conversation_id) {
            return Err(TangError::StorageError(format!(
                "Conversation {} vanished before the message was stored",
                conversation_id
            )));
        }

        inner.next_message_id += 1;
        let (media_type, media_url) = match message.media {
            Some(attachment) => (Some(attachment.kind), Some(attachment.url)),
            None => (None, None),
        };
        let stored = StoredMessage {
            id: inner.next_message_id,
            conversation_id,
            role: message.role,
            content: message.content,
            media_type,
            media_url,
            model_id: message.model_id,
            created_at: Utc::now(),
        };
        inner.messages.push(stored.clone());
        Ok(stored)
    }

    /// Update counters and title after a turn has been stored
    ///
    /// `first_text` is the user text of the turn; it only names the
    /// conversation when the conversation had no earlier messages.
    pub fn finish_turn(&self, conversation_id: i64, first_text: &str) -> Result<Conversation> {
        let mut inner = self.inner.write();
        let count = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .count();

        let conversation = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| TangError::NotFound("Conversation".into()))?;

        let is_first_turn = conversation.message_count == 0;
        conversation.message_count = count;
        conversation.updated_at = Utc::now();
        if is_first_turn && !first_text.is_empty() {
            conversation.title = derive_title(first_text);
        }
        Ok(conversation.clone())
    }

    pub fn rename(&self, id: i64, owner: UserId, title: &str) -> Result<Conversation> {
        let title = validate_title(title)?;
        let mut inner = self.inner.write();
        let conversation = inner
            .conversations
            .get_mut(&id)
            .filter(|c| c.owner == owner)
            .ok_or_else(|| TangError::NotFound("Conversation".into()))?;

        conversation.title = title;
        conversation.updated_at = Utc::now();
        Ok(conversation.clone())
    }

    /// Remove a conversation together with its messages
    pub fn delete(&self, id: i64, owner: UserId) -> Result<()> {
        self.get(id, owner)?;
        let mut inner = self.inner.write();
        inner.conversations.remove(&id);
        inner.messages.retain(|m| m.conversation_id != id);
        debug!("Deleted conversation {} of user {}", id, owner);
        Ok(())
    }

    /// Remove every conversation of `owner`, returning how many went
    pub fn delete_all(&self, owner: UserId) -> usize {
        let mut inner = self.inner.write();
        let doomed: HashSet<i64> = inner
            .conversations
            .values()
            .filter(|c| c.owner == owner)
            .map(|c| c.id)
            .collect();

        inner.conversations.retain(|id, _| !doomed.contains(id));
        inner
            .messages
            .retain(|m| !doomed.contains(&m.conversation_id));
        debug!("Deleted {} conversations of user {}", doomed.len(), owner);
        doomed.len()
    }

    /// Copy a conversation up to and including `message_id` into a new one
    pub fn branch(
        &self,
        id: i64,
        owner: UserId,
        message_id: i64,
        title: Option<&str>,
    ) -> Result<Conversation> {
        let original = self.get(id, owner)?;
        let title = match title {
            Some(title) => validate_title(title)?,
            None => format!("{} (Branch)", original.title),
        };

        let mut inner = self.inner.write();
        let copied: Vec<StoredMessage> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == id && m.id <= message_id)
            .cloned()
            .collect();
        if copied.is_empty() {
            return Err(TangError::InvalidRequest("Invalid branch point".into()));
        }

        inner.next_conversation_id += 1;
        let mut branch = Conversation::new(inner.next_conversation_id, owner);
        branch.title = title;
        branch.parent_id = Some(id);
        branch.message_count = copied.len();

        for message in copied {
            inner.next_message_id += 1;
            let copy = StoredMessage {
                id: inner.next_message_id,
                conversation_id: branch.id,
                created_at: Utc::now(),
                ..message
            };
            inner.messages.push(copy);
        }
        inner.conversations.insert(branch.id, branch.clone());
        debug!(
            "Branched conversation {} at message {} into {}",
            id, message_id, branch.id
        );
        Ok(branch)
    }

    pub fn len(&self) -> usize {
        self.inner.read().conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().conversations.is_empty()
    }
}

fn validate_title(title: &str) -> Result<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(TangError::InvalidRequest("title must not be empty".into()));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(TangError::InvalidRequest(format!(
            "title must be at most {} characters",
            MAX_TITLE_CHARS
        )));
    }
    Ok(title.to_string())
}

/// Title from the first user message: five words, or the first 50 characters
pub fn derive_title(text: &str) -> String {
    let words: Vec<&str> = text.split_whitespace().take(5).collect();
    if words.len() >= 5 {
        format!("{}...", words.join(" "))
    } else if text.chars().count() > 50 {
        format!("{}...", text.chars().take(50).collect::<String>())
    } else {
        text.to_string()
    }
}
