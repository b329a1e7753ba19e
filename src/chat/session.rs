//! Chat turn driver
//!
//! Pumps upstream fragments through the directive filter, runs generation for
//! each dispatch, delivers wire events to the sink and stores the transcript
//! once the response ends.

use super::events::ChatEvent;
use super::sink::{EventSink, PersistReceipt, Undelivered};
use crate::directive::{
    DirectiveFilter, DirectiveKind, DirectiveRequest, DispatchOutcome, FilterConfig, FilterEvent,
    StreamEnd,
};
use crate::generation::GenerationDispatcher;
use crate::llm::FragmentStream;
use crate::messages::UserId;
use crate::{Result, TangError};
use futures::StreamExt;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How a turn ended
#[derive(Clone, Debug)]
pub struct TurnOutcome {
    /// Content stored as the assistant message
    pub persisted: String,
    /// Present when the transcript was stored
    pub receipt: Option<PersistReceipt>,
    /// Upstream failure, if any
    pub error: Option<String>,
    /// The client went away before the end
    pub cancelled: bool,
}

/// One request's worth of model output handling
pub struct ChatTurn<S: EventSink> {
    filter: DirectiveFilter,
    dispatcher: Arc<dyn GenerationDispatcher>,
    sink: S,
    owner: UserId,
    voice: Option<PathBuf>,
}

impl<S: EventSink> ChatTurn<S> {
    pub fn new(
        config: FilterConfig,
        dispatcher: Arc<dyn GenerationDispatcher>,
        sink: S,
        owner: UserId,
    ) -> Self {
        Self {
            filter: DirectiveFilter::new(config),
            dispatcher,
            sink,
            owner,
            voice: None,
        }
    }

    /// Reference voice for speech directives
    pub fn with_voice(mut self, voice: Option<PathBuf>) -> Self {
        self.voice = voice;
        self
    }

    /// Drive the turn to completion and hand the sink back
    pub async fn run(mut self, mut fragments: FragmentStream) -> Result<(TurnOutcome, S)> {
        let mut end = loop {
            match fragments.next().await {
                Some(Ok(fragment)) => {
                    let events = self.filter.process(&fragment);
                    if let Err(lost) = self.deliver(events).await {
                        info!(
                            "Client disconnected, {} bytes and {} artifacts undelivered",
                            lost.display_bytes, lost.artifacts
                        );
                        break cancelled_by(lost);
                    }
                }
                Some(Err(e)) => {
                    error!("Upstream stream failed: {}", e);
                    break StreamEnd::Failed(upstream_reason(e));
                }
                None => break StreamEnd::Completed,
            }
        };
        drop(fragments);

        // Queued is not delivered: wait for the client to take everything
        if !matches!(end, StreamEnd::Cancelled { .. }) {
            if let Err(lost) = self.sink.flush().await {
                info!(
                    "Client left with {} bytes and {} artifacts unread",
                    lost.display_bytes, lost.artifacts
                );
                end = cancelled_by(lost);
            }
        }

        let mut cancelled = matches!(end, StreamEnd::Cancelled { .. });
        let mut events = self.filter.finalize(end);

        let Some(FilterEvent::Terminal {
            mut persisted,
            error,
        }) = events.pop()
        else {
            return Err(TangError::StorageError(
                "Filter finished without a terminal event".into(),
            ));
        };

        if !cancelled {
            let tail: usize = events.iter().map(display_len).sum();
            let delivered = match self.deliver(events).await {
                Ok(()) => self.sink.flush().await,
                Err(lost) => Err(lost),
            };
            if let Err(lost) = delivered {
                debug!("Client left while the held tail was being flushed");
                drop_tail(&mut persisted, lost.display_bytes.min(tail));
                cancelled = true;
            }
        }

        let skip_persist = persisted.is_empty() && (error.is_some() || cancelled);
        let receipt = if skip_persist {
            debug!("Nothing to store for this turn");
            None
        } else {
            Some(self.sink.persist(&persisted).await?)
        };

        if !cancelled {
            let closing = match (&error, &receipt) {
                (Some(reason), _) => Some(ChatEvent::Error {
                    error: reason.clone(),
                }),
                (None, Some(receipt)) => Some(receipt.done_event()),
                (None, None) => None,
            };
            if let Some(event) = closing {
                if let Err(e) = self.sink.emit(event).await {
                    debug!("Closing event not delivered: {}", e);
                }
            }
        }

        Ok((
            TurnOutcome {
                persisted,
                receipt,
                error,
                cancelled,
            },
            self.sink,
        ))
    }

    /// Deliver events in order, running dispatches inline
    ///
    /// On a delivery failure returns everything that never reached the client,
    /// including events still queued in the sink.
    async fn deliver(
        &mut self,
        events: Vec<FilterEvent>,
    ) -> std::result::Result<(), Undelivered> {
        let mut queue: VecDeque<FilterEvent> = events.into();

        while let Some(event) = queue.pop_front() {
            if let FilterEvent::Dispatch(request) = &event {
                let outcome = self.dispatch(request).await;
                let mut resolved: VecDeque<FilterEvent> =
                    self.filter.resolve_dispatch(outcome).into();
                resolved.append(&mut queue);
                queue = resolved;
                continue;
            }

            let Some(wire) = ChatEvent::from_filter(&event) else {
                continue;
            };

            let mut lost = Undelivered::default();
            lost.add(&wire);

            if self.sink.emit(wire).await.is_err() {
                if let Err(in_flight) = self.sink.flush().await {
                    lost.merge(in_flight);
                }
                for rest in queue.iter().filter_map(ChatEvent::from_filter) {
                    lost.add(&rest);
                }
                return Err(lost);
            }
        }

        Ok(())
    }

    async fn dispatch(&self, request: &DirectiveRequest) -> DispatchOutcome {
        debug!("Dispatching {} directive", request.kind.as_str());

        let result = match request.kind {
            DirectiveKind::Image => {
                self.dispatcher
                    .generate_image(&request.argument, self.owner)
                    .await
            }
            DirectiveKind::Speech => {
                self.dispatcher
                    .generate_speech(&request.argument, self.owner, self.voice.as_deref())
                    .await
            }
        };

        match result {
            Ok(artifact) => DispatchOutcome::Delivered { url: artifact.url },
            Err(e) => {
                warn!("{} generation failed: {}", request.kind.as_str(), e);
                DispatchOutcome::Failed {
                    reason: generation_reason(e),
                }
            }
        }
    }
}

fn cancelled_by(lost: Undelivered) -> StreamEnd {
    StreamEnd::Cancelled {
        undelivered: lost.display_bytes,
        lost_artifacts: lost.artifacts,
    }
}

/// Cut `count` trailing bytes, backing off to a char boundary
fn drop_tail(text: &mut String, count: usize) {
    let mut keep = text.len().saturating_sub(count);
    while keep > 0 && !text.is_char_boundary(keep) {
        keep -= 1;
    }
    text.truncate(keep);
}

fn display_len(event: &FilterEvent) -> usize {
    match event {
        FilterEvent::Display(text) => text.len(),
        _ => 0,
    }
}

fn generation_reason(e: TangError) -> String {
    match e {
        TangError::GenerationError(reason) => reason,
        other => other.to_string(),
    }
}

fn upstream_reason(e: TangError) -> String {
    match e {
        TangError::UpstreamError(reason) => reason,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::sink::{BufferedSink, ChannelSink, EventReceiver, TurnRecorder};
    use crate::generation::Artifact;
    use crate::messages::{ConversationStore, NewMessage};
    use async_trait::async_trait;
    use std::path::Path;

    struct StubDispatcher;

    #[async_trait]
    impl GenerationDispatcher for StubDispatcher {
        async fn generate_image(&self, prompt: &str, owner: UserId) -> Result<Artifact> {
            if prompt.contains("fail") {
                return Err(TangError::GenerationError("GPU busy".into()));
            }
            Ok(Artifact {
                url: format!("/api/files/{}/img.png", owner),
                path: PathBuf::from("img.png"),
            })
        }

        async fn generate_speech(
            &self,
            _text: &str,
            owner: UserId,
            _voice: Option<&Path>,
        ) -> Result<Artifact> {
            Ok(Artifact {
                url: format!("/api/files/{}/speech.wav", owner),
                path: PathBuf::from("speech.wav"),
            })
        }
    }

    fn sink() -> (ConversationStore, BufferedSink) {
        let store = ConversationStore::new();
        let conversation = store.create(1);
        store
            .append(conversation.id, NewMessage::user("hi", None))
            .unwrap();
        let recorder = TurnRecorder::new(store.clone(), conversation.id, "hi", "model");
        (store, BufferedSink::new(recorder))
    }

    fn fragments(items: Vec<Result<String>>) -> FragmentStream {
        Box::pin(futures::stream::iter(items))
    }

    fn channel_turn() -> (ConversationStore, ChatTurn<ChannelSink>, EventReceiver) {
        let (store, sink) = sink();
        drop(sink);
        let recorder = TurnRecorder::new(store.clone(), 1, "hi", "model");
        let (sink, rx) = ChannelSink::channel(16, recorder);
        let turn = ChatTurn::new(FilterConfig::default(), Arc::new(StubDispatcher), sink, 1);
        (store, turn, rx)
    }

    #[tokio::test]
    async fn test_text_queued_at_disconnect_is_not_stored() {
        let (store, turn, mut rx) = channel_turn();

        let client = tokio::spawn(async move {
            let first = rx.recv().await;
            drop(rx);
            first
        });
        let (outcome, _) = turn
            .run(fragments(vec![
                Ok("Seen. ".into()),
                Ok("Unseen.".into()),
                Ok(" more".into()),
            ]))
            .await
            .unwrap();

        assert_eq!(
            client.await.unwrap(),
            Some(ChatEvent::Content {
                content: "Seen. ".into()
            })
        );
        assert!(outcome.cancelled);
        assert_eq!(outcome.persisted, "Seen. ");
        let history = store.history(1, 1).unwrap();
        assert_eq!(history.last().unwrap().content, "Seen. ");
    }

    #[tokio::test]
    async fn test_unread_artifact_tag_is_not_stored() {
        let (_, turn, mut rx) = channel_turn();

        let client = tokio::spawn(async move {
            let first = rx.recv().await;
            drop(rx);
            first
        });
        let (outcome, _) = turn
            .run(fragments(vec![
                Ok("Look ".into()),
                Ok("[T2I_REQUEST: a cat] bye".into()),
            ]))
            .await
            .unwrap();

        assert_eq!(
            client.await.unwrap(),
            Some(ChatEvent::Content {
                content: "Look ".into()
            })
        );
        assert!(outcome.cancelled);
        assert_eq!(outcome.persisted, "Look ");
    }

    #[tokio::test]
    async fn test_fully_read_turn_is_stored_whole() {
        let (_, turn, rx) = channel_turn();

        let client = tokio::spawn(async move { rx.into_stream().collect::<Vec<_>>().await });
        let (outcome, sink) = turn
            .run(fragments(vec![
                Ok("Look ".into()),
                Ok("[T2I_REQUEST: a cat] bye".into()),
            ]))
            .await
            .unwrap();
        drop(sink);

        assert!(!outcome.cancelled);
        assert_eq!(outcome.persisted, "Look [T2I_REQUEST: a cat] bye");
        let events = client.await.unwrap();
        assert!(matches!(events.last(), Some(ChatEvent::Done { .. })));
    }

    #[test]
    fn test_drop_tail_respects_char_boundaries() {
        let mut text = String::from("café");
        drop_tail(&mut text, 1);
        assert_eq!(text, "caf");

        let mut text = String::from("abc");
        drop_tail(&mut text, 10);
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn test_turn_with_image_directive() {
        let (_, sink) = sink();
        let turn = ChatTurn::new(FilterConfig::default(), Arc::new(StubDispatcher), sink, 1);

        let (outcome, sink) = turn
            .run(fragments(vec![
                Ok("Here: [T2I_".into()),
                Ok("REQUEST: a cat] enjoy".into()),
            ]))
            .await
            .unwrap();

        assert_eq!(outcome.persisted, "Here: [T2I_REQUEST: a cat] enjoy");
        assert!(outcome.receipt.is_some());

        let events = sink.into_events();
        assert_eq!(
            events[0],
            ChatEvent::Content {
                content: "Here: ".into()
            }
        );
        assert_eq!(
            events[1],
            ChatEvent::Content {
                content: "Generating image for: **a cat**...".into()
            }
        );
        assert_eq!(
            events[2],
            ChatEvent::ImageGenerated {
                url: "/api/files/1/img.png".into(),
                prompt: "a cat".into()
            }
        );
        assert_eq!(
            events[3],
            ChatEvent::Content {
                content: " enjoy".into()
            }
        );
        assert!(matches!(events[4], ChatEvent::Done { .. }));
    }

    #[tokio::test]
    async fn test_failed_generation_continues() {
        let (_, sink) = sink();
        let turn = ChatTurn::new(FilterConfig::default(), Arc::new(StubDispatcher), sink, 1);

        let (outcome, sink) = turn
            .run(fragments(vec![Ok("[T2I_REQUEST: fail please] ok".into())]))
            .await
            .unwrap();

        assert!(outcome.error.is_none());
        assert!(outcome
            .persisted
            .contains("Error generating image: GPU busy"));
        assert!(outcome.persisted.ends_with(" ok"));
        assert!(matches!(sink.events().last(), Some(ChatEvent::Done { .. })));
    }

    #[tokio::test]
    async fn test_upstream_failure_emits_error_not_done() {
        let (_, sink) = sink();
        let turn = ChatTurn::new(FilterConfig::default(), Arc::new(StubDispatcher), sink, 1);

        let (outcome, sink) = turn
            .run(fragments(vec![
                Ok("partial".into()),
                Err(TangError::UpstreamError("connection reset".into())),
            ]))
            .await
            .unwrap();

        assert_eq!(outcome.error.as_deref(), Some("connection reset"));
        assert_eq!(outcome.persisted, "partial");
        let events = sink.into_events();
        assert_eq!(
            events.last(),
            Some(&ChatEvent::Error {
                error: "connection reset".into()
            })
        );
        assert!(!events.iter().any(|e| matches!(e, ChatEvent::Done { .. })));
    }

    #[tokio::test]
    async fn test_empty_failed_turn_is_not_stored() {
        let (store, sink) = sink();
        let turn = ChatTurn::new(FilterConfig::default(), Arc::new(StubDispatcher), sink, 1);

        let (outcome, _) = turn
            .run(fragments(vec![Err(TangError::UpstreamError("refused".into()))]))
            .await
            .unwrap();

        assert!(outcome.receipt.is_none());
        assert_eq!(store.history(1, 1).unwrap().len(), 1);
    }
}
