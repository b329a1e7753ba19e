//! Delivery and persistence seam of a chat turn

use super::events::ChatEvent;
use crate::messages::{Conversation, ConversationStore, NewMessage, StoredMessage};
use crate::{Result, TangError};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// What `persist` stored
#[derive(Clone, Debug)]
pub struct PersistReceipt {
    pub message: StoredMessage,
    pub conversation: Conversation,
}

impl PersistReceipt {
    pub fn done_event(&self) -> ChatEvent {
        ChatEvent::Done {
            message_id: self.message.id,
            conversation_id: self.conversation.id,
            title: self.conversation.title.clone(),
        }
    }
}

/// Output that never reached the client
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Undelivered {
    pub display_bytes: usize,
    pub artifacts: usize,
}

impl Undelivered {
    pub fn add(&mut self, event: &ChatEvent) {
        match event {
            ChatEvent::Content { content } => self.display_bytes += content.len(),
            event if event.is_artifact() => self.artifacts += 1,
            _ => {}
        }
    }

    pub fn merge(&mut self, other: Undelivered) {
        self.display_bytes += other.display_bytes;
        self.artifacts += other.artifacts;
    }
}

/// Receives the classified output of a chat turn
#[async_trait]
pub trait EventSink: Send {
    /// Hand one event over for delivery; an error means the client is gone
    async fn emit(&mut self, event: ChatEvent) -> Result<()>;

    /// Wait until the client has taken every emitted event
    ///
    /// Returns what it never took if it went away first.
    async fn flush(&mut self) -> std::result::Result<(), Undelivered> {
        Ok(())
    }

    /// Store the final assistant transcript
    async fn persist(&mut self, transcript: &str) -> Result<PersistReceipt>;
}

/// Writes the assistant message of one turn into the conversation store
#[derive(Clone, Debug)]
pub struct TurnRecorder {
    store: ConversationStore,
    conversation_id: i64,
    user_text: String,
    model_id: String,
}

impl TurnRecorder {
    pub fn new(
        store: ConversationStore,
        conversation_id: i64,
        user_text: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            conversation_id,
            user_text: user_text.into(),
            model_id: model_id.into(),
        }
    }

    pub fn record(&self, transcript: &str) -> Result<PersistReceipt> {
        let message = self.store.append(
            self.conversation_id,
            NewMessage::assistant(transcript, self.model_id.clone()),
        )?;
        let conversation = self.store.finish_turn(self.conversation_id, &self.user_text)?;
        debug!(
            "Stored assistant message {} ({} bytes) in conversation {}",
            message.id,
            transcript.len(),
            conversation.id
        );
        Ok(PersistReceipt {
            message,
            conversation,
        })
    }
}

/// What the receiving side of a channel has pulled so far
#[derive(Debug, Default)]
struct DeliveryLedger {
    events: AtomicUsize,
    display_bytes: AtomicUsize,
    artifacts: AtomicUsize,
    taken: Notify,
}

impl DeliveryLedger {
    fn record(&self, event: &ChatEvent) {
        let mut weight = Undelivered::default();
        weight.add(event);
        self.display_bytes
            .fetch_add(weight.display_bytes, Ordering::AcqRel);
        self.artifacts.fetch_add(weight.artifacts, Ordering::AcqRel);
        self.events.fetch_add(1, Ordering::AcqRel);
        self.taken.notify_one();
    }
}

/// Sink feeding a server-sent event response through a channel
///
/// An event counts as delivered once the response side has pulled it out of
/// the channel, not when it was queued.
pub struct ChannelSink {
    tx: mpsc::Sender<ChatEvent>,
    recorder: TurnRecorder,
    ledger: Arc<DeliveryLedger>,
    sent_events: usize,
    sent: Undelivered,
}

/// Response side of a [`ChannelSink`]
pub struct EventReceiver {
    rx: mpsc::Receiver<ChatEvent>,
    ledger: Arc<DeliveryLedger>,
}

impl ChannelSink {
    /// Create a sink and the receiver its events are read from
    pub fn channel(capacity: usize, recorder: TurnRecorder) -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        let ledger = Arc::new(DeliveryLedger::default());
        let sink = Self {
            tx,
            recorder,
            ledger: ledger.clone(),
            sent_events: 0,
            sent: Undelivered::default(),
        };
        (sink, EventReceiver { rx, ledger })
    }

    /// Queued events the receiver has not pulled
    fn in_flight(&self) -> Undelivered {
        Undelivered {
            display_bytes: self
                .sent
                .display_bytes
                .saturating_sub(self.ledger.display_bytes.load(Ordering::Acquire)),
            artifacts: self
                .sent
                .artifacts
                .saturating_sub(self.ledger.artifacts.load(Ordering::Acquire)),
        }
    }
}

impl EventReceiver {
    /// Next event, recorded as delivered
    pub async fn recv(&mut self) -> Option<ChatEvent> {
        let event = self.rx.recv().await?;
        self.ledger.record(&event);
        Some(event)
    }

    /// Stream of events, each recorded as delivered when pulled
    pub fn into_stream(self) -> impl Stream<Item = ChatEvent> + Send + 'static {
        let ledger = self.ledger;
        ReceiverStream::new(self.rx).inspect(move |event| ledger.record(event))
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&mut self, event: ChatEvent) -> Result<()> {
        let mut weight = Undelivered::default();
        weight.add(&event);

        self.tx
            .send(event)
            .await
            .map_err(|_| TangError::SinkClosed("event receiver dropped".into()))?;

        self.sent_events += 1;
        self.sent.merge(weight);
        Ok(())
    }

    async fn flush(&mut self) -> std::result::Result<(), Undelivered> {
        loop {
            let taken = self.ledger.taken.notified();
            if self.ledger.events.load(Ordering::Acquire) >= self.sent_events {
                return Ok(());
            }
            if self.tx.is_closed() {
                return Err(self.in_flight());
            }
            tokio::select! {
                _ = taken => {}
                _ = self.tx.closed() => {}
            }
        }
    }

    async fn persist(&mut self, transcript: &str) -> Result<PersistReceipt> {
        self.recorder.record(transcript)
    }
}

/// Sink collecting events in memory, for the non-streaming response
pub struct BufferedSink {
    events: Vec<ChatEvent>,
    recorder: TurnRecorder,
}

impl BufferedSink {
    pub fn new(recorder: TurnRecorder) -> Self {
        Self {
            events: Vec::new(),
            recorder,
        }
    }

    pub fn events(&self) -> &[ChatEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<ChatEvent> {
        self.events
    }
}

#[async_trait]
impl EventSink for BufferedSink {
    async fn emit(&mut self, event: ChatEvent) -> Result<()> {
        self.events.push(event);
        Ok(())
    }

    async fn persist(&mut self, transcript: &str) -> Result<PersistReceipt> {
        self.recorder.record(transcript)
    }
}
