//! Lokale Medien (Mikrofon / Kamera)
//!
//! Die eigentliche Geräteanbindung liegt außerhalb dieser Crate. Der
//! Controller sieht nur [`MediaSource`] und die erteilte [`MediaCapture`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Media access denied: {0}")]
    AccessDenied(String),

    #[error("No media kinds requested")]
    NothingRequested,

    #[error("Media device error: {0}")]
    Device(String),
}

// ============================================================================
// MEDIA TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Welche Medien pro Anruf angefordert werden
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaKinds {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaKinds {
    fn default() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

impl MediaKinds {
    pub fn audio_only() -> Self {
        Self::default()
    }

    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }

    pub fn kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.audio {
            kinds.push(MediaKind::Audio);
        }
        if self.video {
            kinds.push(MediaKind::Video);
        }
        kinds
    }
}

/// Beschreibung eines ausgehenden Tracks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
}

// ============================================================================
// MEDIA SOURCE
// ============================================================================

/// Erteilte Medienfreigabe; wird pro Session genau einmal freigegeben
pub trait MediaCapture: Send {
    fn tracks(&self) -> Vec<MediaTrack>;

    /// Schaltet ausgehendes Audio stumm (ohne Neuverhandlung)
    fn set_muted(&mut self, muted: bool);

    fn is_muted(&self) -> bool;

    /// Gibt die Geräte frei
    fn release(&mut self);
}

/// Fordert lokale Medien an (Berechtigungsdialog o.ä.)
#[async_trait]
pub trait MediaSource: Send + Sync + 'static {
    async fn acquire(&self, kinds: MediaKinds) -> Result<Box<dyn MediaCapture>, MediaError>;
}

// ============================================================================
// HEADLESS SOURCE
// ============================================================================

/// Medienquelle ohne Geräte: erteilt Track-Beschreibungen für die
/// angeforderten Arten (Headless-Betrieb, CLI)
#[derive(Debug, Clone, Default)]
pub struct HeadlessMedia;

#[async_trait]
impl MediaSource for HeadlessMedia {
    async fn acquire(&self, kinds: MediaKinds) -> Result<Box<dyn MediaCapture>, MediaError> {
        if kinds.is_empty() {
            return Err(MediaError::NothingRequested);
        }

        let tracks = kinds
            .kinds()
            .into_iter()
            .map(|kind| MediaTrack {
                id: format!("{:?}", kind).to_lowercase(),
                kind,
            })
            .collect();

        tracing::info!("Headless media granted: {:?}", kinds);

        Ok(Box::new(HeadlessCapture {
            tracks,
            muted: false,
            released: false,
        }))
    }
}

struct HeadlessCapture {
    tracks: Vec<MediaTrack>,
    muted: bool,
    released: bool,
}

impl MediaCapture for HeadlessCapture {
    fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.clone()
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        tracing::debug!("Audio muted: {}", muted);
    }

    fn is_muted(&self) -> bool {
        self.muted
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            tracing::info!("Headless media released");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_headless_grants_requested_kinds() {
        let capture = HeadlessMedia
            .acquire(MediaKinds::audio_video())
            .await
            .unwrap();

        let kinds: Vec<MediaKind> = capture.tracks().iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![MediaKind::Audio, MediaKind::Video]);
        assert_eq!(capture.tracks()[0].id, "audio");
    }

    #[tokio::test]
    async fn test_headless_rejects_empty_request() {
        let result = HeadlessMedia
            .acquire(MediaKinds {
                audio: false,
                video: false,
            })
            .await;
        assert!(matches!(result, Err(MediaError::NothingRequested)));
    }

    #[tokio::test]
    async fn test_mute_toggle() {
        let mut capture = HeadlessMedia.acquire(MediaKinds::audio_only()).await.unwrap();
        assert!(!capture.is_muted());
        capture.set_muted(true);
        assert!(capture.is_muted());
    }
}
