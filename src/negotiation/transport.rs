//! Media Transport Schnittstelle
//!
//! Die eigentliche Transport-Engine (ICE, DTLS/SRTP, Codecs) wird nur über
//! diese Schnittstelle angesprochen.

use super::description::SessionDescription;
use crate::media::{LocalTrack, RemoteTrack};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Expected {expected} description, got {actual}")]
    UnexpectedType {
        expected: &'static str,
        actual: String,
    },

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Transport cannot discard its pending offer")]
    RollbackUnsupported,

    #[error("Negotiator is closed")]
    Closed,
}

// ============================================================================
// TRANSPORT EVENTS
// ============================================================================

/// Events die von einem MediaTransport ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Lokale Beschreibung hat sich geändert, neues Offer nötig
    NegotiationNeeded,

    /// Ein entfernter Track ist angekommen
    RemoteTrack(RemoteTrack),

    /// Verbindung steht
    Connected,

    /// Verbindung verloren
    ConnectionFailed(String),
}

/// Fähigkeiten der Transport-Engine
///
/// `create_offer`/`create_answer` liefern nur den SDP-Text; gesetzt wird er
/// erst über `set_local_description`, das den tatsächlich gültigen lokalen
/// SDP-Text zurückgibt (z.B. ergänzt um gesammelte ICE Candidates).
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn create_offer(&self) -> Result<String, NegotiationError>;

    async fn create_answer(&self) -> Result<String, NegotiationError>;

    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<String, NegotiationError>;

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError>;

    async fn close(&self) -> Result<(), NegotiationError>;

    /// Gibt einen Event-Receiver zurück
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Erzeugt pro Anruf eine frische Transport-Session
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn MediaTransport>, NegotiationError>;
}
