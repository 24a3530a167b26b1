//! Message Types für das Signaling-Protokoll
//!
//! JSON über WebSocket, unterschieden am Feld `type`. Ausgehende
//! Verhandlungsnachrichten tragen `to`, der Relay stempelt beim Weiterleiten
//! den Absender als `from` ein.

use crate::negotiation::SessionDescription;
use crate::room::{ParticipantId, RoomId};
use serde::{Deserialize, Serialize};

// ============================================================================
// ERROR CODES
// ============================================================================

/// Nachricht konnte nicht gelesen werden
pub const ERROR_PROTOCOL: i32 = 400;

/// Empfänger ist nicht im selben Raum
pub const ERROR_NOT_ROOM_PEER: i32 = 403;

/// Raum-ID ungültig
pub const ERROR_INVALID_ROOM: i32 = 422;

/// Ausgehende Queue des Empfängers ist voll
pub const ERROR_QUEUE_FULL: i32 = 503;

// ============================================================================
// SIGNALS & ENVELOPES
// ============================================================================

/// Verhandlungsnachricht zwischen zwei Teilnehmern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    CallOffer(SessionDescription),
    CallAnswer(SessionDescription),
    RenegotiationOffer(SessionDescription),
    RenegotiationAnswer(SessionDescription),
    Hangup,
}

impl Signal {
    /// Wire-Name (für Logging)
    pub fn name(&self) -> &'static str {
        match self {
            Signal::CallOffer(_) => "call:offer",
            Signal::CallAnswer(_) => "call:answer",
            Signal::RenegotiationOffer(_) => "renegotiation:offer",
            Signal::RenegotiationAnswer(_) => "renegotiation:answer",
            Signal::Hangup => "call:hangup",
        }
    }
}

/// Adressierte Verhandlungsnachricht
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub signal: Signal,
}

impl Envelope {
    pub fn new(from: &str, to: &str, signal: Signal) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            signal,
        }
    }
}

// ============================================================================
// CLIENT → RELAY MESSAGES
// ============================================================================

/// Alle möglichen Client-Nachrichten
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Raum beitreten
    #[serde(rename = "room:join", rename_all = "camelCase")]
    RoomJoin {
        room_id: RoomId,
        /// Nur informativ, der Relay vergibt die Identität selbst
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_id: Option<ParticipantId>,
    },

    /// Raum verlassen
    #[serde(rename = "room:leave")]
    RoomLeave,

    #[serde(rename = "call:offer")]
    CallOffer {
        to: ParticipantId,
        offer: SessionDescription,
    },

    #[serde(rename = "call:answer")]
    CallAnswer {
        to: ParticipantId,
        answer: SessionDescription,
    },

    #[serde(rename = "renegotiation:offer")]
    RenegotiationOffer {
        to: ParticipantId,
        offer: SessionDescription,
    },

    #[serde(rename = "renegotiation:answer")]
    RenegotiationAnswer {
        to: ParticipantId,
        answer: SessionDescription,
    },

    /// Anruf beenden
    #[serde(rename = "call:hangup")]
    Hangup { to: ParticipantId },

    /// Heartbeat
    #[serde(rename = "ping")]
    Ping,
}

impl ClientMessage {
    /// Verpackt ein Signal für den Empfänger `to`
    pub fn from_signal(to: ParticipantId, signal: Signal) -> Self {
        match signal {
            Signal::CallOffer(offer) => ClientMessage::CallOffer { to, offer },
            Signal::CallAnswer(answer) => ClientMessage::CallAnswer { to, answer },
            Signal::RenegotiationOffer(offer) => ClientMessage::RenegotiationOffer { to, offer },
            Signal::RenegotiationAnswer(answer) => {
                ClientMessage::RenegotiationAnswer { to, answer }
            }
            Signal::Hangup => ClientMessage::Hangup { to },
        }
    }

    /// Zerlegt eine Verhandlungsnachricht in Empfänger und Signal
    pub fn into_signal(self) -> Option<(ParticipantId, Signal)> {
        match self {
            ClientMessage::CallOffer { to, offer } => Some((to, Signal::CallOffer(offer))),
            ClientMessage::CallAnswer { to, answer } => Some((to, Signal::CallAnswer(answer))),
            ClientMessage::RenegotiationOffer { to, offer } => {
                Some((to, Signal::RenegotiationOffer(offer)))
            }
            ClientMessage::RenegotiationAnswer { to, answer } => {
                Some((to, Signal::RenegotiationAnswer(answer)))
            }
            ClientMessage::Hangup { to } => Some((to, Signal::Hangup)),
            ClientMessage::RoomJoin { .. } | ClientMessage::RoomLeave | ClientMessage::Ping => None,
        }
    }
}

// ============================================================================
// RELAY → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Server-Nachrichten
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Vom Relay vergebene Identität
    #[serde(rename = "welcome", rename_all = "camelCase")]
    Welcome { participant_id: ParticipantId },

    /// Beitritt erfolgreich, `peers` ohne sich selbst
    #[serde(rename = "room:joined", rename_all = "camelCase")]
    RoomJoined {
        room_id: RoomId,
        peers: Vec<ParticipantId>,
    },

    /// Raum ist voll
    #[serde(rename = "room:full", rename_all = "camelCase")]
    RoomFull { room_id: RoomId },

    #[serde(rename = "peer:joined", rename_all = "camelCase")]
    PeerJoined { participant_id: ParticipantId },

    #[serde(rename = "peer:left", rename_all = "camelCase")]
    PeerLeft { participant_id: ParticipantId },

    #[serde(rename = "call:offer")]
    CallOffer {
        from: ParticipantId,
        offer: SessionDescription,
    },

    #[serde(rename = "call:answer")]
    CallAnswer {
        from: ParticipantId,
        answer: SessionDescription,
    },

    #[serde(rename = "renegotiation:offer")]
    RenegotiationOffer {
        from: ParticipantId,
        offer: SessionDescription,
    },

    #[serde(rename = "renegotiation:answer")]
    RenegotiationAnswer {
        from: ParticipantId,
        answer: SessionDescription,
    },

    #[serde(rename = "call:hangup")]
    Hangup { from: ParticipantId },

    /// Nachricht an `to` konnte nicht zugestellt werden
    #[serde(rename = "delivery:failed")]
    DeliveryFailed { to: ParticipantId },

    /// Fehler
    #[serde(rename = "error")]
    Error { code: i32, message: String },

    /// Heartbeat Antwort
    #[serde(rename = "pong")]
    Pong,
}

impl ServerMessage {
    /// Nachricht, die der Empfänger eines Envelopes erhält
    pub fn from_envelope(envelope: Envelope) -> Self {
        let from = envelope.from;
        match envelope.signal {
            Signal::CallOffer(offer) => ServerMessage::CallOffer { from, offer },
            Signal::CallAnswer(answer) => ServerMessage::CallAnswer { from, answer },
            Signal::RenegotiationOffer(offer) => ServerMessage::RenegotiationOffer { from, offer },
            Signal::RenegotiationAnswer(answer) => {
                ServerMessage::RenegotiationAnswer { from, answer }
            }
            Signal::Hangup => ServerMessage::Hangup { from },
        }
    }

    /// Baut den Envelope für den lokalen Empfänger `to` zurück
    pub fn into_envelope(self, to: &str) -> Option<Envelope> {
        let (from, signal) = match self {
            ServerMessage::CallOffer { from, offer } => (from, Signal::CallOffer(offer)),
            ServerMessage::CallAnswer { from, answer } => (from, Signal::CallAnswer(answer)),
            ServerMessage::RenegotiationOffer { from, offer } => {
                (from, Signal::RenegotiationOffer(offer))
            }
            ServerMessage::RenegotiationAnswer { from, answer } => {
                (from, Signal::RenegotiationAnswer(answer))
            }
            ServerMessage::Hangup { from } => (from, Signal::Hangup),
            _ => return None,
        };

        Some(Envelope {
            from,
            to: to.to_string(),
            signal,
        })
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_wire_format() {
        let msg: ClientMessage =
            serde_json::from_value(json!({ "type": "room:join", "roomId": "42" })).unwrap();
        assert_eq!(
            msg,
            ClientMessage::RoomJoin {
                room_id: "42".to_string(),
                participant_id: None,
            }
        );

        let leave = serde_json::to_value(&ClientMessage::RoomLeave).unwrap();
        assert_eq!(leave, json!({ "type": "room:leave" }));
    }

    #[test]
    fn test_server_messages_use_documented_tags() {
        let joined = ServerMessage::RoomJoined {
            room_id: "42".to_string(),
            peers: vec!["a".to_string()],
        };
        assert_eq!(
            serde_json::to_value(&joined).unwrap(),
            json!({ "type": "room:joined", "roomId": "42", "peers": ["a"] })
        );

        let peer = ServerMessage::PeerJoined {
            participant_id: "b".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&peer).unwrap(),
            json!({ "type": "peer:joined", "participantId": "b" })
        );

        let failed = ServerMessage::DeliveryFailed { to: "b".to_string() };
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({ "type": "delivery:failed", "to": "b" })
        );
    }

    #[test]
    fn test_offer_carries_description() {
        let msg = ClientMessage::from_signal(
            "b".to_string(),
            Signal::RenegotiationOffer(SessionDescription::offer("v=0".to_string(), 2)),
        );

        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "renegotiation:offer",
                "to": "b",
                "offer": { "type": "offer", "sdp": "v=0", "revision": 2 }
            })
        );
    }

    #[test]
    fn test_relay_restamps_sender() {
        let outbound = ClientMessage::Hangup { to: "b".to_string() };
        let (to, signal) = outbound.into_signal().unwrap();
        let envelope = Envelope::new("a", &to, signal);

        let inbound = ServerMessage::from_envelope(envelope.clone());
        assert_eq!(
            serde_json::to_value(&inbound).unwrap(),
            json!({ "type": "call:hangup", "from": "a" })
        );
        assert_eq!(inbound.into_envelope("b"), Some(envelope));
    }

    #[test]
    fn test_non_signals_have_no_envelope() {
        assert!(ClientMessage::Ping.into_signal().is_none());
        assert!(ServerMessage::Pong.into_envelope("a").is_none());
    }
}
