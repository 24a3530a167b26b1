//! Lokale Tracks und Streams
//!
//! Ein `LocalTrack` ist ein Handle auf eine Aufnahmequelle. Klone teilen
//! denselben Zustand: wird ein Klon gestoppt, ist die Quelle für alle gestoppt.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Art eines Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type StopHook = Box<dyn FnOnce() + Send>;

struct TrackHandle {
    live: AtomicBool,
    on_stop: Mutex<Option<StopHook>>,
}

// ============================================================================
// LOCAL TRACK
// ============================================================================

/// Lokaler Track mit stabiler ID
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    stream_id: String,
    label: String,
    handle: Arc<TrackHandle>,
}

impl LocalTrack {
    /// Erstellt einen Track; `on_stop` gibt das Gerät frei
    pub fn new<F>(kind: MediaKind, stream_id: &str, label: &str, on_stop: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            stream_id: stream_id.to_string(),
            label: label.to_string(),
            handle: Arc::new(TrackHandle {
                live: AtomicBool::new(true),
                on_stop: Mutex::new(Some(Box::new(on_stop))),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Läuft die Aufnahme noch?
    pub fn is_live(&self) -> bool {
        self.handle.live.load(Ordering::SeqCst)
    }

    /// Stoppt die Aufnahme (idempotent)
    pub fn stop(&self) {
        if self.handle.live.swap(false, Ordering::SeqCst) {
            if let Some(release) = self.handle.on_stop.lock().take() {
                release();
            }
            tracing::debug!("Stopped {} track {}", self.kind, self.id);
        }
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .field("live", &self.is_live())
            .finish()
    }
}

// ============================================================================
// LOCAL STREAM
// ============================================================================

/// Gruppe lokaler Tracks, gestoppt spätestens beim Drop
#[derive(Debug)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(id: String) -> Self {
        Self {
            id,
            tracks: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.iter().map(|t| t.id().to_string()).collect()
    }

    /// Fügt einen Track hinzu, Duplikate (gleiche ID) werden ignoriert
    pub fn add_track(&mut self, track: LocalTrack) -> bool {
        if self.tracks.iter().any(|t| t.id() == track.id()) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    /// Löst die Tracks aus dem Stream, ohne sie zu stoppen
    pub fn into_tracks(mut self) -> Vec<LocalTrack> {
        std::mem::take(&mut self.tracks)
    }

    /// Ist mindestens ein Track noch aktiv?
    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(LocalTrack::is_live)
    }

    /// Stoppt alle Tracks
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl Drop for LocalStream {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// TESTS
// ============================================================================
