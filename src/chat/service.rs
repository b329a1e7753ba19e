//! Request-level chat orchestration
//!
//! Resolves the conversation, stores the user turn, renders the upstream
//! context and runs a [`ChatTurn`] either against a live channel or a buffer.

use super::events::ChatEvent;
use super::references::voice_reference;
use super::session::ChatTurn;
use super::sink::{BufferedSink, ChannelSink, EventReceiver, TurnRecorder};
use crate::directive::FilterConfig;
use crate::generation::{ArtifactStore, GenerationDispatcher};
use crate::llm::{
    build_system_prompt, text_chars, ChatOptions, ContentPart, ConversationContext, LLMClient,
    PartKind,
};
use crate::messages::{
    Attachment, Conversation, ConversationStore, MediaKind, NewMessage, SettingsStore,
    StoredMessage, UserId,
};
use crate::{Result, TangError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Buffered wire events between the turn task and the HTTP response
const EVENT_CHANNEL_CAPACITY: usize = 64;

fn default_stream() -> bool {
    true
}

/// Body of `POST /api/chat`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub conversation_id: Option<i64>,
    pub content: Vec<ContentPart>,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

/// Non-streaming reply
#[derive(Clone, Debug, Serialize)]
pub struct ChatReply {
    pub message: StoredMessage,
    pub conversation_id: i64,
    /// Generated media, in the order it was produced
    pub artifacts: Vec<ChatEvent>,
}

/// Everything a turn needs once the user message is stored
#[derive(Debug)]
pub struct PreparedTurn {
    pub conversation: Conversation,
    pub owner: UserId,
    /// Client with the caller's endpoint and model overrides applied
    llm: LLMClient,
    messages: Vec<Value>,
    options: ChatOptions,
    voice: Option<PathBuf>,
    recorder: TurnRecorder,
}

#[derive(Clone)]
pub struct ChatService {
    llm: LLMClient,
    dispatcher: Arc<dyn GenerationDispatcher>,
    store: ConversationStore,
    settings: SettingsStore,
    artifacts: ArtifactStore,
    filter: FilterConfig,
}

impl ChatService {
    pub fn new(
        llm: LLMClient,
        dispatcher: Arc<dyn GenerationDispatcher>,
        store: ConversationStore,
        settings: SettingsStore,
        artifacts: ArtifactStore,
        filter: FilterConfig,
    ) -> Self {
        Self {
            llm,
            dispatcher,
            store,
            settings,
            artifacts,
            filter,
        }
    }

    pub fn llm(&self) -> &LLMClient {
        &self.llm
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    /// Resolve the conversation, store the user message and build the request
    pub async fn prepare(&self, owner: UserId, request: &ChatRequest) -> Result<PreparedTurn> {
        if request.content.is_empty() {
            return Err(TangError::InvalidRequest("content must not be empty".into()));
        }

        let conversation = match request.conversation_id {
            Some(id) => self.store.get(id, owner)?,
            None => self.store.create(owner),
        };
        let history = self.store.history(conversation.id, owner)?;

        let user_text = request
            .content
            .iter()
            .filter(|p| p.kind == PartKind::Text)
            .filter_map(|p| p.text.clone())
            .last()
            .unwrap_or_default();
        let media = request.content.iter().rev().find_map(|p| {
            let kind = match p.kind {
                PartKind::Image => MediaKind::Image,
                PartKind::Video => MediaKind::Video,
                PartKind::Audio => MediaKind::Audio,
                PartKind::Text => return None,
            };
            p.url.clone().map(|url| Attachment { kind, url })
        });
        self.store
            .append(conversation.id, NewMessage::user(user_text.clone(), media))?;

        let settings = self.settings.get(owner);
        let llm = self.llm.with_overrides(
            settings.api_base_url.as_deref(),
            settings.model_id.as_deref(),
            settings.api_key.as_deref(),
        );
        let config = self.llm.config();
        let system_prompt = settings
            .system_prompt
            .as_deref()
            .or(config.system_prompt.as_deref());

        let context = ConversationContext::new(
            build_system_prompt(system_prompt),
            history,
            config.max_history,
        );
        let messages = context.render(&self.artifacts, &request.content).await;
        let options = ChatOptions {
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            enable_thinking: settings
                .thinking_mode
                .enabled_for(text_chars(&request.content)),
        };
        let voice = voice_reference(&self.artifacts, &request.content, context.history());

        debug!(
            "Prepared turn for conversation {} ({} upstream messages, model {}, voice: {})",
            conversation.id,
            messages.len(),
            llm.model_id(),
            voice.is_some()
        );

        Ok(PreparedTurn {
            recorder: TurnRecorder::new(
                self.store.clone(),
                conversation.id,
                user_text,
                llm.model_id(),
            ),
            conversation,
            owner,
            llm,
            messages,
            options,
            voice,
        })
    }

    /// Run the turn in the background, returning its live event feed
    pub fn stream(&self, prepared: PreparedTurn) -> EventReceiver {
        let PreparedTurn {
            conversation,
            owner,
            llm,
            messages,
            options,
            voice,
            recorder,
        } = prepared;

        let (sink, rx) = ChannelSink::channel(EVENT_CHANNEL_CAPACITY, recorder);
        let fragments = llm.chat_stream(messages, options);
        let turn = ChatTurn::new(
            self.filter.clone(),
            self.dispatcher.clone(),
            sink,
            owner,
        )
        .with_voice(voice);

        tokio::spawn(async move {
            match turn.run(fragments).await {
                Ok((outcome, _)) => info!(
                    "Turn in conversation {} finished (cancelled: {}, error: {})",
                    conversation.id,
                    outcome.cancelled,
                    outcome.error.is_some()
                ),
                Err(e) => error!("Turn in conversation {} failed: {}", conversation.id, e),
            }
        });

        rx
    }

    /// Run the turn to completion and return the stored reply
    pub async fn complete(&self, prepared: PreparedTurn) -> Result<ChatReply> {
        let PreparedTurn {
            conversation,
            owner,
            llm,
            messages,
            options,
            voice,
            recorder,
        } = prepared;

        let completion = llm.complete(messages, options).await?;
        debug!(
            "Completion of {} tokens in {} ms",
            completion.total_tokens, completion.generation_time_ms
        );

        let fragments: crate::llm::FragmentStream =
            Box::pin(futures::stream::iter(vec![Ok(completion.content)]));
        let turn = ChatTurn::new(
            self.filter.clone(),
            self.dispatcher.clone(),
            BufferedSink::new(recorder),
            owner,
        )
        .with_voice(voice);

        let (outcome, sink) = turn.run(fragments).await?;
        let receipt = outcome.receipt.ok_or_else(|| {
            TangError::StorageError(format!(
                "Reply for conversation {} was not stored",
                conversation.id
            ))
        })?;

        Ok(ChatReply {
            message: receipt.message,
            conversation_id: receipt.conversation.id,
            artifacts: sink
                .into_events()
                .into_iter()
                .filter(ChatEvent::is_artifact)
                .collect(),
        })
    }
}
