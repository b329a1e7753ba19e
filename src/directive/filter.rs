//! Streaming directive filter for model output
//!
//! Splits the upstream token stream into text the user should see and inline
//! generation directives (`[T2I_REQUEST: ...]`, `[TTS_REQUEST: ...]`) that are
//! dispatched instead of displayed. Handles directives split across fragment
//! boundaries and never lets a raw directive tag reach the display.
//!
//! The filter is a pure state machine: it performs no I/O. Dispatch events are
//! handed to the caller, which runs the generation call and reports back via
//! [`DirectiveFilter::resolve_dispatch`].

use crate::directive::markers::{MarkerKind, MarkerSet, MARKER_CLOSE, MARKER_OPEN};
use crate::{Result, TangError};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{debug, warn};

/// Maximum characters held back while deciding whether a `[` opens a directive
pub const DEFAULT_LOOKAHEAD_CHARS: usize = 20;

/// Speech directives shorter than this are treated as truncation noise
pub const DEFAULT_MIN_SPEECH_CHARS: usize = 10;

/// Cap on a directive argument before it is abandoned as malformed
pub const DEFAULT_MAX_DIRECTIVE_CHARS: usize = 4096;

/// What to do when a response contains more than one directive
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatPolicy {
    /// Dispatch every directive; the stored transcript keeps each canonical tag
    #[default]
    DispatchAll,
    /// Dispatch only the first directive and silently drop later ones
    FirstOnly,
}

/// Tunables for the directive filter
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Recognised directive spellings and thinking tags
    pub markers: MarkerSet,

    /// Hard cap on characters held back before a `[` is declared ordinary text
    pub lookahead_chars: usize,

    /// Minimum trimmed length of a speech directive argument
    pub min_speech_chars: usize,

    /// Safety cap on an unterminated directive (None = unbounded)
    pub max_directive_chars: Option<usize>,

    /// Behaviour for multiple directives in one response
    pub repeat_policy: RepeatPolicy,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            markers: MarkerSet::default(),
            lookahead_chars: DEFAULT_LOOKAHEAD_CHARS,
            min_speech_chars: DEFAULT_MIN_SPEECH_CHARS,
            max_directive_chars: Some(DEFAULT_MAX_DIRECTIVE_CHARS),
            repeat_policy: RepeatPolicy::DispatchAll,
        }
    }
}

impl FilterConfig {
    /// Set the look-ahead budget
    pub fn with_lookahead(mut self, chars: usize) -> Self {
        self.lookahead_chars = chars;
        self
    }

    /// Set the minimum speech argument length
    pub fn with_min_speech_chars(mut self, chars: usize) -> Self {
        self.min_speech_chars = chars;
        self
    }

    /// Set the directive argument cap
    pub fn with_max_directive_chars(mut self, chars: Option<usize>) -> Self {
        self.max_directive_chars = chars;
        self
    }

    /// Set the multiple-directive policy
    pub fn with_repeat_policy(mut self, policy: RepeatPolicy) -> Self {
        self.repeat_policy = policy;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.markers.prefixes.is_empty() {
            return Err(TangError::ConfigError(
                "At least one directive prefix is required".into(),
            ));
        }

        for prefix in &self.markers.prefixes {
            if !prefix.literal.starts_with(MARKER_OPEN) {
                return Err(TangError::ConfigError(format!(
                    "Directive prefix {:?} must start with '{}'",
                    prefix.literal, MARKER_OPEN
                )));
            }
            if !prefix.kind.is_directive() {
                return Err(TangError::ConfigError(format!(
                    "Directive prefix {:?} must be an image or speech request",
                    prefix.literal
                )));
            }
        }

        if self.lookahead_chars < self.markers.longest_prefix_chars() {
            return Err(TangError::ConfigError(format!(
                "Look-ahead budget ({}) is shorter than the longest directive prefix ({})",
                self.lookahead_chars,
                self.markers.longest_prefix_chars()
            )));
        }

        if self.markers.think_open.is_empty() || self.markers.think_close.is_empty() {
            return Err(TangError::ConfigError("Thinking tags must not be empty".into()));
        }

        Ok(())
    }
}

/// Generation capability a directive asks for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveKind {
    Image,
    Speech,
}

impl DirectiveKind {
    fn from_marker(kind: MarkerKind) -> Option<Self> {
        match kind {
            MarkerKind::ImageRequest => Some(DirectiveKind::Image),
            MarkerKind::SpeechRequest => Some(DirectiveKind::Speech),
            _ => None,
        }
    }

    pub fn marker(&self) -> MarkerKind {
        match self {
            DirectiveKind::Image => MarkerKind::ImageRequest,
            DirectiveKind::Speech => MarkerKind::SpeechRequest,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DirectiveKind::Image => "image",
            DirectiveKind::Speech => "speech",
        }
    }
}

/// A fully parsed directive awaiting dispatch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectiveRequest {
    pub kind: DirectiveKind,
    pub argument: String,
}

/// Result of a generation call, reported back to the filter
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The artifact was produced and stored at `url`
    Delivered { url: String },
    /// The generation call failed
    Failed { reason: String },
}

/// How the upstream stream ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    /// The model finished normally
    Completed,
    /// The model connection failed
    Failed(String),
    /// The client went away before receiving everything
    Cancelled {
        /// Trailing display bytes that never reached it
        undelivered: usize,
        /// Trailing artifact events that never reached it
        lost_artifacts: usize,
    },
}

/// Classified output of the filter
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterEvent {
    /// Text to show the user
    Display(String),

    /// A directive to execute
    Dispatch(DirectiveRequest),

    /// A dispatched directive produced an artifact
    Artifact {
        kind: DirectiveKind,
        url: String,
        argument: String,
    },

    /// End of the response
    Terminal {
        /// Assistant message content to store
        persisted: String,
        /// Set when the upstream failed
        error: Option<String>,
    },
}

/// Current classification mode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterMode {
    /// Ordinary text, scanning for `[`
    Passthrough,
    /// A directive prefix matched; buffering its argument until `]`
    AccumulatingCandidate { kind: MarkerKind, prefix_len: usize },
    /// Inside `<think>...</think>`; no directive recognition
    ThinkingBlock,
}

/// Mutable per-response state
#[derive(Clone, Debug)]
pub struct FilterState {
    pub mode: FilterMode,

    /// Held-back text; empty or starting with `[`
    pub pending_buffer: String,

    /// Everything emitted as display text so far
    pub display_accumulator: String,

    /// Replacement for the stored content once a directive was delivered
    pub persisted_override: Option<String>,
}

impl Default for FilterState {
    fn default() -> Self {
        Self {
            mode: FilterMode::Passthrough,
            pending_buffer: String::new(),
            display_accumulator: String::new(),
            persisted_override: None,
        }
    }
}

#[derive(Clone, Debug)]
struct AwaitingDispatch {
    request: DirectiveRequest,
    /// Persisted view just before the directive's progress notice
    persisted_base: String,
}

/// Streaming filter separating display text from generation directives
///
/// One instance serves exactly one model response. Call [`process`] for each
/// fragment, [`resolve_dispatch`] after every [`FilterEvent::Dispatch`], and
/// [`finalize`] once when the upstream ends.
///
/// [`process`]: DirectiveFilter::process
/// [`resolve_dispatch`]: DirectiveFilter::resolve_dispatch
/// [`finalize`]: DirectiveFilter::finalize
#[derive(Clone, Debug)]
pub struct DirectiveFilter {
    config: FilterConfig,
    state: FilterState,

    /// Display length at the moment the override was written
    override_mark: usize,

    /// Byte ranges of canonical tags inside the override, in delivery order
    tag_spans: Vec<Range<usize>>,

    /// Directive whose outcome has not been reported yet
    awaiting: Option<AwaitingDispatch>,

    /// Input received while a dispatch is outstanding
    deferred: String,

    /// Number of directives dispatched in this response
    dispatched: usize,

    /// Current directive outgrew the cap and is dropped at its close
    overflowed: bool,

    terminated: bool,
}

impl Default for DirectiveFilter {
    fn default() -> Self {
        Self::new(FilterConfig::default())
    }
}

impl DirectiveFilter {
    /// Create a filter for one response
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            state: FilterState::default(),
            override_mark: 0,
            tag_spans: Vec::new(),
            awaiting: None,
            deferred: String::new(),
            dispatched: 0,
            overflowed: false,
            terminated: false,
        }
    }

    /// Current state snapshot
    pub fn state(&self) -> &FilterState {
        &self.state
    }

    /// Whether a dispatch event is waiting for its outcome
    pub fn has_pending_dispatch(&self) -> bool {
        self.awaiting.is_some()
    }

    /// Whether the terminal event has been produced
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Feed one upstream fragment
    pub fn process(&mut self, fragment: &str) -> Vec<FilterEvent> {
        let mut events = Vec::new();

        if self.terminated {
            warn!("Fragment received after terminal event, ignoring");
            return events;
        }

        self.consume(fragment, &mut events);
        events
    }

    /// Report the outcome of the outstanding dispatch
    ///
    /// Returns the artifact or error notice, followed by events for any text
    /// that arrived after the directive closed.
    pub fn resolve_dispatch(&mut self, outcome: DispatchOutcome) -> Vec<FilterEvent> {
        let mut events = Vec::new();

        if self.terminated {
            warn!("Dispatch outcome received after terminal event, ignoring");
            return events;
        }

        let Some(awaiting) = self.awaiting.take() else {
            warn!("Dispatch outcome received with no directive outstanding");
            return events;
        };

        let DirectiveRequest { kind, argument } = awaiting.request;

        match outcome {
            DispatchOutcome::Delivered { url } => {
                debug!("{} directive delivered: {}", kind.as_str(), url);
                if let Some(tag) = self.config.markers.canonical_tag(kind.marker(), &argument) {
                    let start = awaiting.persisted_base.len();
                    self.tag_spans.push(start..start + tag.len());
                    self.state.persisted_override =
                        Some(format!("{}{}", awaiting.persisted_base, tag));
                    self.override_mark = self.state.display_accumulator.len();
                }
                events.push(FilterEvent::Artifact {
                    kind,
                    url,
                    argument,
                });
            }
            DispatchOutcome::Failed { reason } => {
                warn!("{} directive failed: {}", kind.as_str(), reason);
                let notice = match kind {
                    DirectiveKind::Image => format!("\n\nError generating image: {}", reason),
                    DirectiveKind::Speech => format!("\nFailed to generate audio: {}", reason),
                };
                self.emit_display(&notice, &mut events);
            }
        }

        let deferred = std::mem::take(&mut self.deferred);
        if !deferred.is_empty() {
            self.consume(&deferred, &mut events);
        }

        events
    }

    /// End the response and produce the terminal event
    pub fn finalize(&mut self, end: StreamEnd) -> Vec<FilterEvent> {
        let mut events = Vec::new();

        if self.terminated {
            warn!("finalize called twice, ignoring");
            return events;
        }

        if let Some(awaiting) = self.awaiting.take() {
            warn!(
                "Stream ended with an unresolved {} directive",
                awaiting.request.kind.as_str()
            );
        }
        if !self.deferred.is_empty() {
            debug!("Dropping {} bytes received after an unresolved directive", self.deferred.len());
            self.deferred.clear();
        }

        let mut lost_tags = 0;
        let error = match end {
            StreamEnd::Completed => {
                self.drain_held(&mut events);
                None
            }
            StreamEnd::Failed(reason) => {
                if !self.state.pending_buffer.is_empty() {
                    debug!(
                        "Discarding {} held bytes after upstream failure",
                        self.state.pending_buffer.len()
                    );
                }
                self.state.pending_buffer.clear();
                Some(reason)
            }
            StreamEnd::Cancelled {
                undelivered,
                lost_artifacts,
            } => {
                self.state.pending_buffer.clear();
                self.retract_display(undelivered);
                lost_tags = lost_artifacts.min(self.tag_spans.len());
                None
            }
        };

        self.state.mode = FilterMode::Passthrough;
        self.terminated = true;

        // Tags of artifacts the client never saw are not stored
        let mut persisted = self.persisted_view();
        for span in self.tag_spans.iter().rev().take(lost_tags) {
            persisted.replace_range(span.clone(), "");
        }
        if lost_tags > 0 {
            debug!("Dropped {} undelivered artifact tags", lost_tags);
        }

        events.push(FilterEvent::Terminal { persisted, error });
        events
    }

    /// Route text through thinking-block handling, then directive scanning
    fn consume(&mut self, text: &str, events: &mut Vec<FilterEvent>) {
        let think_open = self.config.markers.think_open.clone();
        let think_close = self.config.markers.think_close.clone();
        let mut rest = text;

        while !rest.is_empty() {
            if self.awaiting.is_some() {
                self.deferred.push_str(rest);
                return;
            }

            if self.state.mode == FilterMode::ThinkingBlock {
                match rest.find(think_close.as_str()) {
                    Some(pos) => {
                        let end = pos + think_close.len();
                        self.emit_display(&rest[..end], events);
                        self.state.mode = FilterMode::Passthrough;
                        debug!("Thinking block closed");
                        rest = &rest[end..];
                    }
                    None => {
                        self.emit_display(rest, events);
                        return;
                    }
                }
                continue;
            }

            if self.config.markers.thinking_tag(rest) != MarkerKind::ThinkingOpen {
                self.scan(rest, events);
                return;
            }

            let Some(pos) = rest.find(think_open.as_str()) else {
                self.scan(rest, events);
                return;
            };

            self.scan(&rest[..pos], events);
            if self.awaiting.is_some() {
                self.deferred.push_str(&rest[pos..]);
                return;
            }

            self.interrupt_for_thinking(events);
            let end = pos + think_open.len();
            self.emit_display(&rest[pos..end], events);
            self.state.mode = FilterMode::ThinkingBlock;
            debug!("Thinking block opened");
            rest = &rest[end..];
        }
    }

    /// Directive scanning outside thinking blocks
    fn scan(&mut self, text: &str, events: &mut Vec<FilterEvent>) {
        let mut buffer = std::mem::take(&mut self.state.pending_buffer);
        buffer.push_str(text);
        let mut cursor = 0;

        while cursor < buffer.len() {
            let slice = &buffer[cursor..];

            match self.state.mode {
                FilterMode::AccumulatingCandidate { kind, prefix_len } => {
                    match slice[prefix_len..].find(MARKER_CLOSE) {
                        Some(offset) => {
                            let close = prefix_len + offset;
                            let over_cap = std::mem::take(&mut self.overflowed)
                                || self.exceeds_cap(&slice[..close]);
                            let argument = slice[prefix_len..close].trim().to_string();
                            cursor += close + MARKER_CLOSE.len_utf8();
                            self.state.mode = FilterMode::Passthrough;

                            if over_cap {
                                warn!("Oversized {:?} directive discarded", kind);
                                continue;
                            }
                            self.complete_directive(kind, argument, events);

                            if self.awaiting.is_some() {
                                self.deferred.push_str(&buffer[cursor..]);
                                return;
                            }
                        }
                        None => {
                            if self.overflowed || self.exceeds_cap(slice) {
                                if !self.overflowed {
                                    warn!(
                                        "Directive exceeded {} chars without closing, dropping its text",
                                        slice.chars().count()
                                    );
                                }
                                // Keep scanning for the close without holding the text
                                self.overflowed = true;
                                self.state.mode =
                                    FilterMode::AccumulatingCandidate { kind, prefix_len: 0 };
                            } else {
                                self.state.pending_buffer.push_str(slice);
                            }
                            return;
                        }
                    }
                }
                FilterMode::Passthrough | FilterMode::ThinkingBlock => {
                    let Some(open) = slice.find(MARKER_OPEN) else {
                        self.emit_display(slice, events);
                        return;
                    };

                    if open > 0 {
                        self.emit_display(&slice[..open], events);
                        cursor += open;
                        continue;
                    }

                    let matched = self
                        .config
                        .markers
                        .match_prefix(slice)
                        .map(|p| (p.kind, p.literal.len()));

                    if let Some((kind, prefix_len)) = matched {
                        debug!("Directive prefix matched: {:?}", kind);
                        self.state.mode = FilterMode::AccumulatingCandidate { kind, prefix_len };
                        continue;
                    }

                    let within_budget = slice.chars().count() <= self.config.lookahead_chars;
                    if within_budget && self.config.markers.is_partial_prefix(slice) {
                        self.state.pending_buffer.push_str(slice);
                        return;
                    }

                    // False alarm: release up to the next candidate bracket
                    let next = slice[MARKER_OPEN.len_utf8()..]
                        .find(MARKER_OPEN)
                        .map(|i| i + MARKER_OPEN.len_utf8())
                        .unwrap_or(slice.len());
                    self.emit_display(&slice[..next], events);
                    cursor += next;
                }
            }
        }
    }

    /// Apply directive policies once the closing bracket has been seen
    fn complete_directive(
        &mut self,
        marker: MarkerKind,
        argument: String,
        events: &mut Vec<FilterEvent>,
    ) {
        let Some(kind) = DirectiveKind::from_marker(marker) else {
            warn!("Unexpected marker {:?} completed as a directive, discarding", marker);
            return;
        };

        if argument.is_empty() {
            warn!("Malformed {} directive with empty argument, discarding", kind.as_str());
            return;
        }

        if kind == DirectiveKind::Speech
            && argument.chars().count() < self.config.min_speech_chars
        {
            debug!(
                "Ignoring speech directive shorter than {} chars",
                self.config.min_speech_chars
            );
            return;
        }

        if self.config.repeat_policy == RepeatPolicy::FirstOnly && self.dispatched > 0 {
            debug!("Ignoring additional {} directive in this response", kind.as_str());
            return;
        }

        let persisted_base = self.persisted_view();
        let notice = match kind {
            DirectiveKind::Image => format!("Generating image for: **{}**...", argument),
            DirectiveKind::Speech => format!("Generating audio for: **{}**...", argument),
        };
        self.emit_display(&notice, events);

        let request = DirectiveRequest { kind, argument };
        events.push(FilterEvent::Dispatch(request.clone()));
        self.dispatched += 1;
        self.awaiting = Some(AwaitingDispatch {
            request,
            persisted_base,
        });
    }

    /// Flush held text at a normal end of stream or a thinking interrupt
    fn drain_held(&mut self, events: &mut Vec<FilterEvent>) {
        match self.state.mode {
            FilterMode::AccumulatingCandidate { kind, .. } => {
                warn!("Unterminated {:?} directive discarded", kind);
                self.state.pending_buffer.clear();
                self.overflowed = false;
                self.state.mode = FilterMode::Passthrough;
            }
            FilterMode::Passthrough | FilterMode::ThinkingBlock => {
                let held = std::mem::take(&mut self.state.pending_buffer);
                self.emit_display(&held, events);
            }
        }
    }

    fn exceeds_cap(&self, text: &str) -> bool {
        self.config
            .max_directive_chars
            .is_some_and(|max| text.chars().count() > max)
    }

    fn interrupt_for_thinking(&mut self, events: &mut Vec<FilterEvent>) {
        self.drain_held(events);
        self.state.mode = FilterMode::Passthrough;
    }

    /// Drop display text the client never received
    fn retract_display(&mut self, undelivered: usize) {
        let display = &mut self.state.display_accumulator;
        let mut keep = display.len().saturating_sub(undelivered).max(self.override_mark);
        while keep > 0 && !display.is_char_boundary(keep) {
            keep -= 1;
        }
        display.truncate(keep);
    }

    /// What would be stored if the response ended now
    fn persisted_view(&self) -> String {
        match &self.state.persisted_override {
            Some(persisted) => format!(
                "{}{}",
                persisted,
                &self.state.display_accumulator[self.override_mark..]
            ),
            None => self.state.display_accumulator.clone(),
        }
    }

    fn emit_display(&mut self, text: &str, events: &mut Vec<FilterEvent>) {
        if text.is_empty() {
            return;
        }

        self.state.display_accumulator.push_str(text);

        if let Some(FilterEvent::Display(last)) = events.last_mut() {
            last.push_str(text);
        } else {
            events.push(FilterEvent::Display(text.to_string()));
        }
    }
}
