//! Media Capture
//!
//! Abstraktion über den Zugriff auf Aufnahmegeräte. Ein Fehler hier beendet
//! nur den aktuellen Anrufversuch, nie die Raum-Mitgliedschaft.

use super::track::{LocalStream, LocalTrack, MediaKind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Media device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("No media kind requested")]
    NothingRequested,
}

// ============================================================================
// CAPTURE REQUEST
// ============================================================================

/// Welche Quellen aufgenommen werden sollen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub audio: bool,
    pub video: bool,
}

impl CaptureRequest {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    fn kinds(&self) -> Vec<MediaKind> {
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

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Zugriff auf Aufnahmegeräte
pub trait MediaCapture: Send + Sync {
    /// Öffnet einen neuen Stream mit den angeforderten Tracks
    fn acquire(&self, request: &CaptureRequest) -> Result<LocalStream, MediaError> {
        let kinds = request.kinds();
        if kinds.is_empty() {
            return Err(MediaError::NothingRequested);
        }

        let stream_id = uuid::Uuid::new_v4().to_string();
        let mut stream = LocalStream::new(stream_id.clone());
        for kind in kinds {
            // Bei einem Fehler stoppt der Drop von `stream` bereits geöffnete Tracks
            let track = self.acquire_track(kind, &stream_id)?;
            stream.add_track(track);
        }
        Ok(stream)
    }

    /// Öffnet einen einzelnen Track für einen bestehenden Stream
    fn acquire_track(&self, kind: MediaKind, stream_id: &str) -> Result<LocalTrack, MediaError>;
}

// ============================================================================
// SYNTHETIC CAPTURE
// ============================================================================

/// Geräteloser Capture, zählt aktive Tracks
///
/// Für Headless-Betrieb und Tests gedacht.
#[derive(Debug, Clone)]
pub struct SyntheticCapture {
    active: Arc<AtomicUsize>,
    available: Arc<AtomicBool>,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Capture, dessen Geräte nicht verfügbar sind
    pub fn unavailable() -> Self {
        let capture = Self::new();
        capture.set_available(false);
        capture
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Anzahl noch nicht gestoppter Tracks
    pub fn active_tracks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaCapture for SyntheticCapture {
    fn acquire_track(&self, kind: MediaKind, stream_id: &str) -> Result<LocalTrack, MediaError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(MediaError::DeviceUnavailable(format!(
                "synthetic {} source disabled",
                kind
            )));
        }

        self.active.fetch_add(1, Ordering::SeqCst);
        let active = Arc::clone(&self.active);
        let label = format!("synthetic-{}", kind);

        Ok(LocalTrack::new(kind, stream_id, &label, move || {
            active.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_default_request() {
        let capture = SyntheticCapture::new();
        let stream = capture.acquire(&CaptureRequest::default()).unwrap();

        assert_eq!(stream.tracks().len(), 2);
        assert_eq!(capture.active_tracks(), 2);

        stream.stop();
        assert_eq!(capture.active_tracks(), 0);
    }

    #[test]
    fn test_unavailable_device() {
        let capture = SyntheticCapture::unavailable();
        let result = capture.acquire(&CaptureRequest::audio_only());

        assert!(matches!(result, Err(MediaError::DeviceUnavailable(_))));
        assert_eq!(capture.active_tracks(), 0);
    }

    #[test]
    fn test_empty_request() {
        let capture = SyntheticCapture::new();
        let request = CaptureRequest {
            audio: false,
            video: false,
        };
        assert_eq!(
            capture.acquire(&request).unwrap_err(),
            MediaError::NothingRequested
        );
    }
}
