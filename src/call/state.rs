//! Call State, Events und Fehler

use crate::media::{MediaError, RemoteStream};
use crate::negotiation::NegotiationError;
use crate::signaling::SignalingError;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Cannot {action} while {state}")]
    InvalidState {
        state: CallState,
        action: &'static str,
    },

    #[error("Envelope from {actual} does not belong to this call")]
    PeerMismatch { actual: String },

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Call is terminated")]
    Terminated,

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Zustand eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// Angelegt, noch nichts verhandelt
    Idle,
    /// Offer gesendet, warte auf Answer
    Offering,
    /// Offer erhalten, Answer wird erzeugt
    Answering,
    /// Verbunden
    Connected,
    /// Renegotiation-Offer gesendet
    Negotiating,
    /// Beendet (endgültig)
    Terminated,
}

impl CallState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, CallState::Terminated)
    }

    /// Läuft bereits ein verbundener Anruf?
    pub fn is_established(&self) -> bool {
        matches!(self, CallState::Connected | CallState::Negotiating)
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CallState::Idle => "idle",
            CallState::Offering => "offering",
            CallState::Answering => "answering",
            CallState::Connected => "connected",
            CallState::Negotiating => "negotiating",
            CallState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Warum ein Anruf beendet wurde
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum TerminationReason {
    /// Lokal aufgelegt
    LocalHangup,
    /// Gegenseite hat aufgelegt
    RemoteHangup,
    /// Gegenseite hat den Raum verlassen
    PeerLeft,
    /// Lokal den Raum verlassen
    LeftRoom,
    /// Nachricht an die Gegenseite nicht zustellbar
    DeliveryFailed,
    /// Verbindung zum Relay verloren
    SignalingLost,
    /// Transport-Session fehlgeschlagen
    TransportFailed(String),
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::LocalHangup => f.write_str("local hangup"),
            TerminationReason::RemoteHangup => f.write_str("remote hangup"),
            TerminationReason::PeerLeft => f.write_str("peer left"),
            TerminationReason::LeftRoom => f.write_str("left room"),
            TerminationReason::DeliveryFailed => f.write_str("delivery failed"),
            TerminationReason::SignalingLost => f.write_str("signaling lost"),
            TerminationReason::TransportFailed(reason) => {
                write!(f, "transport failed: {}", reason)
            }
        }
    }
}

// ============================================================================
// CALL EVENTS
// ============================================================================

/// Events die von einem Call ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// Zustand hat sich geändert
    StateChanged(CallState),

    /// Lokaler Stream ist angehängt
    LocalStream {
        stream_id: String,
        track_ids: Vec<String>,
    },

    /// Zusammengesetzter Remote-Stream hat einen neuen Track
    RemoteStream(RemoteStream),

    /// Anruf beendet
    Terminated { reason: TerminationReason },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_established_states() {
        assert!(CallState::Connected.is_established());
        assert!(CallState::Negotiating.is_established());
        assert!(!CallState::Offering.is_established());
        assert!(!CallState::Answering.is_established());
        assert!(!CallState::Terminated.is_established());
    }
}
