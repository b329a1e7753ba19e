//! Storage for generated media
//!
//! Artifacts live under `{upload_dir}/{owner}/{file}` and are served back to
//! the client as `/api/files/{owner}/{file}`.

use crate::messages::UserId;
use crate::{Result, TangError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Local;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// URL prefix under which uploaded and generated files are served
pub const FILES_ROUTE: &str = "/api/files";

/// A stored media file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Public URL under `/api/files`
    pub url: String,
    /// Location on disk
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    url_pattern: Regex,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let url_pattern = Regex::new(r"/api/files/(\d+)/([^/]+)$")
            .map_err(|e| TangError::ConfigError(format!("File URL pattern: {}", e)))?;
        Ok(Self {
            root: root.into(),
            url_pattern,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `bytes` into the owner's directory and return the public URL
    pub async fn save(&self, owner: UserId, filename: &str, bytes: &[u8]) -> Result<Artifact> {
        let dir = self.root.join(owner.to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(filename);
        tokio::fs::write(&path, bytes).await?;
        debug!("Saved {} bytes to {}", bytes.len(), path.display());

        Ok(Artifact {
            url: format!("{}/{}/{}", FILES_ROUTE, owner, filename),
            path,
        })
    }

    /// Map a `/api/files/{owner}/{file}` URL back to an existing local file
    pub fn resolve_url(&self, url: &str) -> Option<PathBuf> {
        if !url.starts_with(FILES_ROUTE) {
            return None;
        }

        let captures = self.url_pattern.captures(url)?;
        let owner = captures.get(1)?.as_str();
        let filename = captures.get(2)?.as_str();
        if filename == "." || filename == ".." {
            return None;
        }

        let path = self.root.join(owner).join(filename);
        path.is_file().then_some(path)
    }
}

/// Build `{prefix}_{timestamp}_{snippet}_{id8}.{ext}`
pub fn artifact_filename(prefix: &str, snippet: &str, ext: &str) -> String {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let id = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}_{}.{}", prefix, timestamp, snippet, &id[..8], ext)
}

/// Filename-safe excerpt of a prompt
///
/// Looks at the first `window` characters, keeps alphanumerics and spaces,
/// joins words with underscores and caps the result at `max_chars`.
pub fn filename_snippet(text: &str, window: usize, max_chars: usize) -> String {
    let kept: String = text
        .chars()
        .take(window)
        .filter(|c| c.is_alphanumeric() || *c == ' ')
        .collect();
    kept.trim().replace(' ', "_").chars().take(max_chars).collect()
}

/// Decode a base64 media payload as returned by the generation services
///
/// Tolerates a `data:...;base64,` prefix, surrounding whitespace and missing
/// padding.
pub fn decode_media_base64(data: &str) -> Result<Vec<u8>> {
    let body = match data.split_once(',') {
        Some((_, rest)) => rest,
        None => data,
    };

    let mut cleaned: String = body.trim().to_string();
    let missing = cleaned.len() % 4;
    if missing != 0 {
        cleaned.extend(std::iter::repeat('=').take(4 - missing));
    }

    STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|e| TangError::GenerationError(format!("Failed to decode base64 payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();

        let artifact = store.save(3, "t2i_test.png", b"png-bytes").await.unwrap();
        assert_eq!(artifact.url, "/api/files/3/t2i_test.png");

        let path = store.resolve_url(&artifact.url).unwrap();
        assert_eq!(path, artifact.path);
        assert_eq!(std::fs::read(path).unwrap(), b"png-bytes");
    }

    #[test]
    fn test_resolve_rejects_unknown_urls() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();

        assert!(store.resolve_url("/api/files/3/missing.png").is_none());
        assert!(store.resolve_url("https://example.com/a.png").is_none());
        assert!(store.resolve_url("/api/files/abc/a.png").is_none());
        assert!(store.resolve_url("/api/files/3/..").is_none());
    }

    #[test]
    fn test_filename_snippet() {
        assert_eq!(filename_snippet("A red fox, at dawn!", 30, 20), "A_red_fox_at_dawn");
        assert_eq!(
            filename_snippet("one two three four five six seven", 30, 20),
            "one_two_three_four_f"
        );
        assert_eq!(filename_snippet("  ***  ", 20, usize::MAX), "");
    }

    #[test]
    fn test_artifact_filename_shape() {
        let name = artifact_filename("tts", "hello", "wav");
        assert!(name.starts_with("tts_"));
        assert!(name.ends_with(".wav"));
        assert!(name.contains("_hello_"));
    }

    #[test]
    fn test_decode_repairs_payload() {
        let encoded = STANDARD.encode(b"abcde");
        let unpadded = encoded.trim_end_matches('=');

        assert_eq!(decode_media_base64(unpadded).unwrap(), b"abcde");
        assert_eq!(
            decode_media_base64(&format!("data:image/png;base64,{}\n", encoded)).unwrap(),
            b"abcde"
        );
        assert!(decode_media_base64("!!!").is_err());
    }
}
