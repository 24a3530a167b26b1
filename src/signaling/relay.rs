//! Relay Hub
//!
//! Reiner Router ohne Transport: Verbindungsregister (Teilnehmer → ausgehende
//! Queue) plus Room Directory. Zustellung nur an verbundene Teilnehmer im
//! selben Raum, sonst wird die Nachricht verworfen und der Fehler gemeldet.

use super::messages::{
    ClientMessage, Envelope, ServerMessage, ERROR_INVALID_ROOM, ERROR_NOT_ROOM_PEER,
    ERROR_QUEUE_FULL,
};
use crate::config::RelayConfig;
use crate::room::{DirectoryEvent, ParticipantId, RoomDirectory, RoomError, RoomId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Could not deliver message to {to}")]
    DeliveryFailed { to: ParticipantId },

    #[error("{from} and {to} do not share a room")]
    NotRoomPeer {
        from: ParticipantId,
        to: ParticipantId,
    },

    #[error("Room {0} is full")]
    RoomFull(RoomId),

    #[error("Timed out waiting for room join")]
    JoinTimeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error: {code} - {message}")]
    Server { code: i32, message: String },
}

impl From<RoomError> for SignalingError {
    fn from(e: RoomError) -> Self {
        match e {
            RoomError::RoomFull(room_id) => SignalingError::RoomFull(room_id),
            RoomError::InvalidRoomId => SignalingError::Server {
                code: ERROR_INVALID_ROOM,
                message: e.to_string(),
            },
        }
    }
}

// ============================================================================
// RELAY TRAIT
// ============================================================================

/// Zustellung von Verhandlungsnachrichten
///
/// Fire-and-forget: `Ok` heißt nur, dass die Nachricht in der Queue des
/// Empfängers liegt.
pub trait Relay: Send + Sync {
    fn send(&self, envelope: Envelope) -> Result<(), SignalingError>;
}

// ============================================================================
// RELAY HUB
// ============================================================================

/// Verbindungsregister und Router
pub struct RelayHub {
    directory: RoomDirectory,
    directory_rx: Mutex<broadcast::Receiver<DirectoryEvent>>,
    connections: RwLock<HashMap<ParticipantId, mpsc::Sender<ServerMessage>>>,
    outbound_capacity: usize,
    report_delivery_failures: bool,
}

impl RelayHub {
    pub fn new(config: &RelayConfig) -> Self {
        let directory = RoomDirectory::new();
        let directory_rx = Mutex::new(directory.subscribe());

        Self {
            directory,
            directory_rx,
            connections: RwLock::new(HashMap::new()),
            outbound_capacity: config.outbound_capacity,
            report_delivery_failures: config.report_delivery_failures,
        }
    }

    pub fn directory(&self) -> &RoomDirectory {
        &self.directory
    }

    pub fn is_connected(&self, participant_id: &str) -> bool {
        self.connections.read().contains_key(participant_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Registriert eine neue Verbindung und vergibt die Identität
    pub fn connect(&self) -> (ParticipantId, mpsc::Receiver<ServerMessage>) {
        let participant_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.outbound_capacity);

        self.connections.write().insert(participant_id.clone(), tx);
        tracing::info!("Participant {} connected", participant_id);

        self.notify(
            &participant_id,
            ServerMessage::Welcome {
                participant_id: participant_id.clone(),
            },
        );
        (participant_id, rx)
    }

    /// Tritt einem Raum bei und benachrichtigt den anderen Teilnehmer
    pub fn join(
        &self,
        participant_id: &str,
        room_id: &str,
    ) -> Result<Vec<ParticipantId>, RoomError> {
        let result = self.directory.join(room_id, participant_id);
        self.flush_directory_events();

        match &result {
            Ok(peers) => tracing::info!(
                "Participant {} joined room {} (peers: {:?})",
                participant_id,
                room_id,
                peers
            ),
            Err(e) => tracing::warn!("Participant {} could not join: {}", participant_id, e),
        }
        result
    }

    /// Verlässt den aktuellen Raum (idempotent)
    pub fn leave(&self, participant_id: &str) -> Option<RoomId> {
        let room = self.directory.leave(participant_id);
        self.flush_directory_events();

        if let Some(room_id) = &room {
            tracing::info!("Participant {} left room {}", participant_id, room_id);
        }
        room
    }

    /// Entfernt eine Verbindung samt Raum-Mitgliedschaft
    ///
    /// Die Queue des Teilnehmers wird geschlossen.
    pub fn disconnect(&self, participant_id: &str) {
        self.leave(participant_id);
        if self.connections.write().remove(participant_id).is_some() {
            tracing::info!("Participant {} disconnected", participant_id);
        }
    }

    /// Verarbeitet eine Nachricht einer Verbindung
    pub fn handle_client_message(&self, from: &str, msg: ClientMessage) {
        match msg {
            ClientMessage::RoomJoin { room_id, .. } => {
                let reply = match self.join(from, &room_id) {
                    Ok(peers) => ServerMessage::RoomJoined { room_id, peers },
                    Err(RoomError::RoomFull(room_id)) => ServerMessage::RoomFull { room_id },
                    Err(e @ RoomError::InvalidRoomId) => {
                        ServerMessage::error(ERROR_INVALID_ROOM, e.to_string())
                    }
                };
                self.notify(from, reply);
            }

            ClientMessage::RoomLeave => {
                self.leave(from);
            }

            ClientMessage::Ping => {
                self.notify(from, ServerMessage::Pong);
            }

            other => {
                let Some((to, signal)) = other.into_signal() else {
                    return;
                };
                let envelope = Envelope::new(from, &to, signal);

                match self.send(envelope) {
                    Ok(()) => {}
                    Err(SignalingError::DeliveryFailed { to }) => {
                        if self.report_delivery_failures {
                            self.notify(from, ServerMessage::DeliveryFailed { to });
                        }
                    }
                    Err(e @ SignalingError::NotRoomPeer { .. }) => {
                        self.notify(from, ServerMessage::error(ERROR_NOT_ROOM_PEER, e.to_string()));
                    }
                    Err(e) => {
                        self.notify(from, ServerMessage::error(ERROR_QUEUE_FULL, e.to_string()));
                    }
                }
            }
        }
    }

    /// Schickt einem Teilnehmer eine Relay-Nachricht (best effort)
    pub fn notify(&self, participant_id: &str, msg: ServerMessage) {
        if let Err(e) = self.push(participant_id, msg) {
            tracing::debug!("Could not notify {}: {}", participant_id, e);
        }
    }

    /// Legt eine Nachricht in die Queue eines Teilnehmers
    fn push(&self, participant_id: &str, msg: ServerMessage) -> Result<(), SignalingError> {
        let tx = self
            .connections
            .read()
            .get(participant_id)
            .cloned()
            .ok_or_else(|| SignalingError::DeliveryFailed {
                to: participant_id.to_string(),
            })?;

        tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                tracing::warn!("Outbound queue of {} is full", participant_id);
                SignalingError::SendFailed(format!("outbound queue of {} is full", participant_id))
            }
            mpsc::error::TrySendError::Closed(_) => SignalingError::DeliveryFailed {
                to: participant_id.to_string(),
            },
        })
    }

    /// Leitet Directory-Events als Nachrichten weiter
    fn flush_directory_events(&self) {
        let mut rx = self.directory_rx.lock();
        loop {
            let event = match rx.try_recv() {
                Ok(event) => event,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!("Dropped {} directory events", n);
                    continue;
                }
                Err(_) => break,
            };

            let (notify, msg) = match event {
                DirectoryEvent::PeerJoined {
                    participant_id,
                    notify,
                    ..
                } => (notify, ServerMessage::PeerJoined { participant_id }),
                DirectoryEvent::PeerLeft {
                    participant_id,
                    notify,
                    ..
                } => (notify, ServerMessage::PeerLeft { participant_id }),
            };

            self.notify(&notify, msg);
        }
    }
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new(&RelayConfig::default())
    }
}

impl Relay for RelayHub {
    fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        if !self.is_connected(&envelope.to) {
            tracing::warn!(
                "Dropping {} from {}: {} is not connected",
                envelope.signal.name(),
                envelope.from,
                envelope.to
            );
            return Err(SignalingError::DeliveryFailed { to: envelope.to });
        }

        if !self.directory.share_room(&envelope.from, &envelope.to) {
            tracing::warn!(
                "Rejecting {} from {} to {}: not in the same room",
                envelope.signal.name(),
                envelope.from,
                envelope.to
            );
            return Err(SignalingError::NotRoomPeer {
                from: envelope.from,
                to: envelope.to,
            });
        }

        tracing::debug!(
            "Relaying {} from {} to {}",
            envelope.signal.name(),
            envelope.from,
            envelope.to
        );
        let to = envelope.to.clone();
        self.push(&to, ServerMessage::from_envelope(envelope))
    }
}

impl std::fmt::Debug for RelayHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHub")
            .field("connections", &self.connection_count())
            .field("rooms", &self.directory.room_count())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
