//! Reference media lookup for generation requests

use crate::generation::ArtifactStore;
use crate::llm::ContentPart;
use crate::messages::{MediaKind, Role, StoredMessage};
use std::path::{Path, PathBuf};

/// Extensions accepted as a cloning reference voice
const VOICE_EXTENSIONS: &[&str] = &["wav", "mp3", "m4a", "ogg", "flac"];

fn is_audio_url(url: &str) -> bool {
    Path::new(url)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| VOICE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Pick the voice to clone for speech generation
///
/// The first local audio upload of the current turn wins; otherwise the most
/// recent user audio message in history that still exists on disk.
pub fn voice_reference(
    store: &ArtifactStore,
    turn: &[ContentPart],
    history: &[StoredMessage],
) -> Option<PathBuf> {
    let from_turn = turn
        .iter()
        .filter_map(|part| part.url.as_deref())
        .filter(|url| is_audio_url(url))
        .find_map(|url| store.resolve_url(url));

    from_turn.or_else(|| {
        history
            .iter()
            .rev()
            .filter(|m| m.role == Role::User && m.media_type == Some(MediaKind::Audio))
            .filter_map(|m| m.media_url.as_deref())
            .find_map(|url| store.resolve_url(url))
    })
}
