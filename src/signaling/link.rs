//! Signaling Link
//!
//! Sicht eines Teilnehmers auf den Relay: Identität, Raumbeitritt, Events.
//! `SignalingClient` spricht WebSocket, `LocalLink` hängt direkt an einem
//! `RelayHub` im selben Prozess.

use super::messages::{Envelope, ServerMessage};
use super::relay::{Relay, RelayHub, SignalingError};
use crate::room::{ParticipantId, RoomId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 100;

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die von einem SignalingLink ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// Verbunden, Identität vergeben
    Connected { participant_id: ParticipantId },

    /// Verbindung getrennt
    Disconnected,

    /// Raumbeitritt bestätigt
    RoomJoined {
        room_id: RoomId,
        peers: Vec<ParticipantId>,
    },

    /// Raum ist voll
    RoomFull { room_id: RoomId },

    /// Zweiter Teilnehmer ist beigetreten
    PeerJoined { participant_id: ParticipantId },

    /// Anderer Teilnehmer hat den Raum verlassen
    PeerLeft { participant_id: ParticipantId },

    /// Verhandlungsnachricht erhalten
    Envelope(Envelope),

    /// Eigene Nachricht war nicht zustellbar
    DeliveryFailed { to: ParticipantId },

    /// Fehler vom Relay
    Error { code: i32, message: String },
}

impl SignalingEvent {
    /// Übersetzt eine Relay-Nachricht für den Teilnehmer `local_id`
    pub fn from_server_message(local_id: &str, msg: ServerMessage) -> Option<Self> {
        let event = match msg {
            ServerMessage::Welcome { participant_id } => {
                SignalingEvent::Connected { participant_id }
            }
            ServerMessage::RoomJoined { room_id, peers } => {
                SignalingEvent::RoomJoined { room_id, peers }
            }
            ServerMessage::RoomFull { room_id } => SignalingEvent::RoomFull { room_id },
            ServerMessage::PeerJoined { participant_id } => {
                SignalingEvent::PeerJoined { participant_id }
            }
            ServerMessage::PeerLeft { participant_id } => {
                SignalingEvent::PeerLeft { participant_id }
            }
            ServerMessage::DeliveryFailed { to } => SignalingEvent::DeliveryFailed { to },
            ServerMessage::Error { code, message } => SignalingEvent::Error { code, message },
            ServerMessage::Pong => return None,
            other => SignalingEvent::Envelope(other.into_envelope(local_id)?),
        };
        Some(event)
    }
}

// ============================================================================
// SIGNALING LINK
// ============================================================================

/// Verbindung eines Teilnehmers zum Relay
#[async_trait]
pub trait SignalingLink: Relay {
    /// Vom Relay vergebene Identität
    fn participant_id(&self) -> ParticipantId;

    /// Gibt einen Event-Receiver zurück
    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent>;

    /// Tritt einem Raum bei, liefert die anwesenden Teilnehmer
    async fn join_room(&self, room_id: &str) -> Result<Vec<ParticipantId>, SignalingError>;

    /// Verlässt den aktuellen Raum
    async fn leave_room(&self) -> Result<(), SignalingError>;
}

// ============================================================================
// LOCAL LINK
// ============================================================================

/// In-Process Verbindung zu einem `RelayHub`
pub struct LocalLink {
    hub: Arc<RelayHub>,
    participant_id: ParticipantId,
    event_tx: broadcast::Sender<SignalingEvent>,
    pump: JoinHandle<()>,
}

impl LocalLink {
    /// Verbindet sich mit dem Hub; muss innerhalb einer Tokio Runtime laufen
    pub fn connect(hub: Arc<RelayHub>) -> Self {
        let (participant_id, mut rx) = hub.connect();
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let local_id = participant_id.clone();
        let tx = event_tx.clone();
        let pump = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Some(event) = SignalingEvent::from_server_message(&local_id, msg) {
                    let _ = tx.send(event);
                }
            }
            tracing::debug!("Local link {} closed", local_id);
            let _ = tx.send(SignalingEvent::Disconnected);
        });

        Self {
            hub,
            participant_id,
            event_tx,
            pump,
        }
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    /// Trennt die Verbindung wie ein geschlossener Socket
    pub fn disconnect(&self) {
        self.hub.disconnect(&self.participant_id);
    }
}

impl Relay for LocalLink {
    fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        if envelope.from != self.participant_id {
            return Err(SignalingError::Protocol(format!(
                "envelope sender {} is not {}",
                envelope.from, self.participant_id
            )));
        }
        if !self.hub.is_connected(&self.participant_id) {
            return Err(SignalingError::NotConnected);
        }
        self.hub.send(envelope)
    }
}

#[async_trait]
impl SignalingLink for LocalLink {
    fn participant_id(&self) -> ParticipantId {
        self.participant_id.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    async fn join_room(&self, room_id: &str) -> Result<Vec<ParticipantId>, SignalingError> {
        if !self.hub.is_connected(&self.participant_id) {
            return Err(SignalingError::NotConnected);
        }
        Ok(self.hub.join(&self.participant_id, room_id)?)
    }

    async fn leave_room(&self) -> Result<(), SignalingError> {
        self.hub.leave(&self.participant_id);
        Ok(())
    }
}

impl Drop for LocalLink {
    fn drop(&mut self) {
        self.hub.disconnect(&self.participant_id);
        self.pump.abort();
    }
}

impl std::fmt::Debug for LocalLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLink")
            .field("participant_id", &self.participant_id)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::Signal;
    use std::time::Duration;

    async fn next_event(rx: &mut broadcast::Receiver<SignalingEvent>) -> SignalingEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for signaling event")
            .expect("event channel closed")
    }

    /// Überspringt Events bis eines passt (Connected, RoomJoined, ...)
    async fn next_matching<F>(rx: &mut broadcast::Receiver<SignalingEvent>, pred: F) -> SignalingEvent
    where
        F: Fn(&SignalingEvent) -> bool,
    {
        loop {
            let event = next_event(rx).await;
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_announces_identity_first() {
        let hub = Arc::new(RelayHub::default());
        let a = LocalLink::connect(Arc::clone(&hub));
        let mut events = a.subscribe();

        a.join_room("42").await.unwrap();

        assert_eq!(
            next_event(&mut events).await,
            SignalingEvent::Connected {
                participant_id: a.participant_id()
            }
        );
    }

    #[tokio::test]
    async fn test_peers_and_peer_joined() {
        let hub = Arc::new(RelayHub::default());
        let a = LocalLink::connect(Arc::clone(&hub));
        let b = LocalLink::connect(Arc::clone(&hub));
        let mut events_a = a.subscribe();

        assert!(a.join_room("42").await.unwrap().is_empty());
        assert_eq!(b.join_room("42").await.unwrap(), vec![a.participant_id()]);

        assert_eq!(
            next_matching(&mut events_a, |e| matches!(e, SignalingEvent::PeerJoined { .. })).await,
            SignalingEvent::PeerJoined {
                participant_id: b.participant_id()
            }
        );
    }

    #[tokio::test]
    async fn test_envelope_arrives_addressed_to_self() {
        let hub = Arc::new(RelayHub::default());
        let a = LocalLink::connect(Arc::clone(&hub));
        let b = LocalLink::connect(Arc::clone(&hub));
        let mut events_b = b.subscribe();
        a.join_room("42").await.unwrap();
        b.join_room("42").await.unwrap();

        let envelope = Envelope::new(&a.participant_id(), &b.participant_id(), Signal::Hangup);
        a.send(envelope.clone()).unwrap();

        assert_eq!(
            next_matching(&mut events_b, |e| matches!(e, SignalingEvent::Envelope(_))).await,
            SignalingEvent::Envelope(envelope)
        );
    }

    #[tokio::test]
    async fn test_room_full_surfaces_at_join() {
        let hub = Arc::new(RelayHub::default());
        let links: Vec<_> = (0..3).map(|_| LocalLink::connect(Arc::clone(&hub))).collect();

        links[0].join_room("42").await.unwrap();
        links[1].join_room("42").await.unwrap();

        assert_eq!(
            links[2].join_room("42").await,
            Err(SignalingError::RoomFull("42".to_string()))
        );
    }

    #[tokio::test]
    async fn test_disconnect_emits_disconnected() {
        let hub = Arc::new(RelayHub::default());
        let a = LocalLink::connect(Arc::clone(&hub));
        let mut events = a.subscribe();

        a.disconnect();

        loop {
            if next_event(&mut events).await == SignalingEvent::Disconnected {
                break;
            }
        }
        assert!(matches!(
            a.send(Envelope::new(&a.participant_id(), "b", Signal::Hangup)),
            Err(SignalingError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_rejects_forged_sender() {
        let hub = Arc::new(RelayHub::default());
        let a = LocalLink::connect(Arc::clone(&hub));

        let result = a.send(Envelope::new("someone-else", "b", Signal::Hangup));
        assert!(matches!(result, Err(SignalingError::Protocol(_))));
    }
}
