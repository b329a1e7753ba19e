//! Directive marker definitions
//!
//! Literal spellings of the inline generation directives the model is taught
//! to emit, plus the thinking-block tags that switch directive recognition off.

use serde::{Deserialize, Serialize};

/// Opening spelling of an image generation directive
pub const IMAGE_REQUEST: &str = "[T2I_REQUEST:";

/// Opening spelling of a speech generation directive
pub const SPEECH_REQUEST: &str = "[TTS_REQUEST:";

/// Older speech spelling some models still produce
pub const SPEECH_REQUEST_LEGACY: &str = "[Text to speak:";

/// Opening tag of a reasoning block
pub const THINK_OPEN: &str = "<think>";

/// Closing tag of a reasoning block
pub const THINK_CLOSE: &str = "</think>";

/// Character every directive starts with
pub const MARKER_OPEN: char = '[';

/// Character that terminates a directive argument
pub const MARKER_CLOSE: char = ']';

/// Classification of a markup token in model output
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    /// `[T2I_REQUEST: prompt]`
    ImageRequest,
    /// `[TTS_REQUEST: text]` or a synonym
    SpeechRequest,
    /// `<think>`
    ThinkingOpen,
    /// `</think>`
    ThinkingClose,
    /// Ordinary text
    None,
}

impl MarkerKind {
    /// Whether this kind triggers a generation call
    pub fn is_directive(&self) -> bool {
        matches!(self, MarkerKind::ImageRequest | MarkerKind::SpeechRequest)
    }
}

/// One accepted spelling of a directive opening
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerPrefix {
    /// Literal text, including the opening bracket and the colon
    pub literal: String,

    /// Directive this spelling opens
    pub kind: MarkerKind,
}

impl MarkerPrefix {
    pub fn new(literal: impl Into<String>, kind: MarkerKind) -> Self {
        Self {
            literal: literal.into(),
            kind,
        }
    }
}

/// The full set of recognised spellings
///
/// The first prefix listed for a kind is its canonical spelling, used when a
/// directive is written back into the stored transcript.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerSet {
    pub prefixes: Vec<MarkerPrefix>,
    pub think_open: String,
    pub think_close: String,
}

impl Default for MarkerSet {
    fn default() -> Self {
        Self {
            prefixes: vec![
                MarkerPrefix::new(IMAGE_REQUEST, MarkerKind::ImageRequest),
                MarkerPrefix::new(SPEECH_REQUEST, MarkerKind::SpeechRequest),
                MarkerPrefix::new(SPEECH_REQUEST_LEGACY, MarkerKind::SpeechRequest),
            ],
            think_open: THINK_OPEN.to_string(),
            think_close: THINK_CLOSE.to_string(),
        }
    }
}

impl MarkerSet {
    /// Find the prefix `buffer` starts with, preferring the longest literal
    pub fn match_prefix(&self, buffer: &str) -> Option<&MarkerPrefix> {
        self.prefixes
            .iter()
            .filter(|p| buffer.starts_with(p.literal.as_str()))
            .max_by_key(|p| p.literal.len())
    }

    /// Check if `buffer` could still grow into one of the prefixes
    pub fn is_partial_prefix(&self, buffer: &str) -> bool {
        self.prefixes
            .iter()
            .any(|p| p.literal.len() > buffer.len() && p.literal.starts_with(buffer))
    }

    /// Check if text contains a complete directive opening anywhere
    pub fn contains_directive(&self, text: &str) -> bool {
        self.prefixes.iter().any(|p| text.contains(p.literal.as_str()))
    }

    /// Length in characters of the longest literal
    pub fn longest_prefix_chars(&self) -> usize {
        self.prefixes
            .iter()
            .map(|p| p.literal.chars().count())
            .max()
            .unwrap_or(0)
    }

    /// Canonical spelling for a directive kind
    pub fn canonical_prefix(&self, kind: MarkerKind) -> Option<&str> {
        self.prefixes
            .iter()
            .find(|p| p.kind == kind)
            .map(|p| p.literal.as_str())
    }

    /// Re-serialize a parsed directive as `[PREFIX: argument]`
    pub fn canonical_tag(&self, kind: MarkerKind, argument: &str) -> Option<String> {
        self.canonical_prefix(kind)
            .map(|prefix| format!("{} {}{}", prefix, argument, MARKER_CLOSE))
    }

    /// Classify a thinking tag contained in a fragment
    pub fn thinking_tag(&self, fragment: &str) -> MarkerKind {
        if fragment.contains(self.think_open.as_str()) {
            MarkerKind::ThinkingOpen
        } else if fragment.contains(self.think_close.as_str()) {
            MarkerKind::ThinkingClose
        } else {
            MarkerKind::None
        }
    }
}
