//! Room Directory
//!
//! Hält die Zuordnung Raum → Teilnehmer und Teilnehmer → Raum.
//! Ein Raum entsteht beim ersten Beitritt und verschwindet mit dem letzten Teilnehmer.

use super::{ParticipantId, RoomId};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Maximale Anzahl Teilnehmer pro Raum (1:1 Anruf)
pub const ROOM_CAPACITY: usize = 2;

const EVENT_CAPACITY: usize = 100;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("Room {0} is full")]
    RoomFull(RoomId),

    #[error("Invalid room id")]
    InvalidRoomId,
}

// ============================================================================
// DIRECTORY EVENTS
// ============================================================================

/// Events die vom RoomDirectory ausgelöst werden
///
/// `notify` ist jeweils der Teilnehmer, der die Nachricht erhalten soll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    /// Ein zweiter Teilnehmer ist dem Raum beigetreten
    PeerJoined {
        room_id: RoomId,
        participant_id: ParticipantId,
        notify: ParticipantId,
    },

    /// Ein Teilnehmer hat den Raum verlassen
    PeerLeft {
        room_id: RoomId,
        participant_id: ParticipantId,
        notify: ParticipantId,
    },
}

// ============================================================================
// DIRECTORY
// ============================================================================

#[derive(Debug, Default)]
struct DirectoryState {
    rooms: HashMap<RoomId, Vec<ParticipantId>>,
    membership: HashMap<ParticipantId, RoomId>,
}

/// Verzeichnis aller Räume (thread-safe durch RwLock)
pub struct RoomDirectory {
    state: RwLock<DirectoryState>,
    event_tx: broadcast::Sender<DirectoryEvent>,
}

impl RoomDirectory {
    /// Erstellt ein leeres Verzeichnis
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            state: RwLock::new(DirectoryState::default()),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<DirectoryEvent> {
        self.event_tx.subscribe()
    }

    /// Tritt einem Raum bei
    ///
    /// Gibt die bereits anwesenden Teilnehmer (ohne sich selbst) zurück.
    /// Ein voller Raum wird abgelehnt, niemand wird verdrängt.
    pub fn join(
        &self,
        room_id: &str,
        participant_id: &str,
    ) -> Result<Vec<ParticipantId>, RoomError> {
        if room_id.trim().is_empty() {
            return Err(RoomError::InvalidRoomId);
        }

        let mut events = Vec::new();
        let peers = {
            let mut state = self.state.write();

            let current_room = state.membership.get(participant_id).cloned();
            match current_room.as_deref() {
                Some(current) if current == room_id => {
                    // Erneuter Beitritt zum selben Raum ist idempotent
                    return Ok(Self::peers_of(&state, room_id, participant_id));
                }
                Some(_) => {
                    // Prüfen bevor der alte Raum verlassen wird
                    if Self::occupancy(&state, room_id) >= ROOM_CAPACITY {
                        return Err(RoomError::RoomFull(room_id.to_string()));
                    }
                    Self::remove_member(&mut state, participant_id, &mut events);
                }
                None => {}
            }

            let occupants = state.rooms.entry(room_id.to_string()).or_default();
            if occupants.len() >= ROOM_CAPACITY {
                tracing::info!(
                    "Rejecting {} from room {}: room is full",
                    participant_id,
                    room_id
                );
                return Err(RoomError::RoomFull(room_id.to_string()));
            }

            let peers = occupants.clone();
            occupants.push(participant_id.to_string());
            state
                .membership
                .insert(participant_id.to_string(), room_id.to_string());

            for peer in &peers {
                events.push(DirectoryEvent::PeerJoined {
                    room_id: room_id.to_string(),
                    participant_id: participant_id.to_string(),
                    notify: peer.clone(),
                });
            }

            peers
        };

        tracing::info!(
            "{} joined room {} ({} peer(s) present)",
            participant_id,
            room_id,
            peers.len()
        );

        self.emit(events);
        Ok(peers)
    }

    /// Verlässt den aktuellen Raum (no-op falls in keinem Raum)
    pub fn leave(&self, participant_id: &str) -> Option<RoomId> {
        let mut events = Vec::new();
        let room_id = {
            let mut state = self.state.write();
            Self::remove_member(&mut state, participant_id, &mut events)
        };

        if let Some(ref room_id) = room_id {
            tracing::info!("{} left room {}", participant_id, room_id);
        }

        self.emit(events);
        room_id
    }

    /// Sucht den Raum eines Teilnehmers
    pub fn lookup_room(&self, participant_id: &str) -> Option<RoomId> {
        self.state.read().membership.get(participant_id).cloned()
    }

    /// Gibt die Teilnehmer eines Raums in Beitrittsreihenfolge zurück
    pub fn occupants(&self, room_id: &str) -> Vec<ParticipantId> {
        self.state
            .read()
            .rooms
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Prüft ob zwei Teilnehmer denselben Raum teilen
    pub fn share_room(&self, a: &str, b: &str) -> bool {
        let state = self.state.read();
        match (state.membership.get(a), state.membership.get(b)) {
            (Some(room_a), Some(room_b)) => room_a == room_b,
            _ => false,
        }
    }

    /// Anzahl existierender Räume
    pub fn room_count(&self) -> usize {
        self.state.read().rooms.len()
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn occupancy(state: &DirectoryState, room_id: &str) -> usize {
        state.rooms.get(room_id).map(Vec::len).unwrap_or(0)
    }

    fn peers_of(state: &DirectoryState, room_id: &str, participant_id: &str) -> Vec<ParticipantId> {
        state
            .rooms
            .get(room_id)
            .map(|occupants| {
                occupants
                    .iter()
                    .filter(|p| p.as_str() != participant_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn remove_member(
        state: &mut DirectoryState,
        participant_id: &str,
        events: &mut Vec<DirectoryEvent>,
    ) -> Option<RoomId> {
        let room_id = state.membership.remove(participant_id)?;

        let now_empty = match state.rooms.get_mut(&room_id) {
            Some(occupants) => {
                occupants.retain(|p| p != participant_id);
                for peer in occupants.iter() {
                    events.push(DirectoryEvent::PeerLeft {
                        room_id: room_id.clone(),
                        participant_id: participant_id.to_string(),
                        notify: peer.clone(),
                    });
                }
                occupants.is_empty()
            }
            None => false,
        };

        if now_empty {
            state.rooms.remove(&room_id);
            tracing::debug!("Room {} removed", room_id);
        }

        Some(room_id)
    }

    fn emit(&self, events: Vec<DirectoryEvent>) {
        for event in events {
            // Ohne Subscriber geht das Event verloren, das ist gewollt
            let _ = self.event_tx.send(event);
        }
    }
}

impl Default for RoomDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RoomDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("RoomDirectory")
            .field("rooms", &state.rooms)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
