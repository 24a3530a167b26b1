//! Remote Stream
//!
//! Eingehende Tracks werden zu einem einzigen zusammengesetzten Stream
//! gesammelt, egal ob sie gebündelt oder einzeln ankommen.

use super::track::MediaKind;
use serde::{Deserialize, Serialize};

/// Nur-Lese-Beschreibung eines empfangenen Tracks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    /// Stream des Senders, falls der Track gebündelt ankam
    pub stream_id: Option<String>,
}

/// Zusammengesetzter eingehender Stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteStream {
    id: Option<String>,
    tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn count_of(&self, kind: MediaKind) -> usize {
        self.tracks.iter().filter(|t| t.kind == kind).count()
    }

    /// Fügt einen Track hinzu; `false` falls die ID schon bekannt ist
    pub fn add_track(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        if self.id.is_none() {
            self.id = track.stream_id.clone();
        }
        self.tracks.push(track);
        true
    }
}
