//! RoomCall - Raumbasierte P2P Audio/Video-Anrufe
//!
//! Zwei Teilnehmer treffen sich über eine gemeinsame Raum-ID:
//! - Relay (WebSocket) für Rendezvous und Signaling
//! - Session Negotiation mit Offer/Answer und Neuverhandlung
//! - WebRTC oder In-Process Loopback als Media Transport
//! - Lokale Tracks, die beim Auflegen sofort freigegeben werden

pub mod call;
pub mod config;
pub mod endpoint;
pub mod media;
pub mod negotiation;
pub mod room;
pub mod signaling;

pub use call::{Call, CallError, CallEvent, CallState, TerminationReason};
pub use config::{ClientConfig, ConfigError, RelayConfig};
pub use endpoint::{Endpoint, EndpointError, EndpointEvent};
pub use room::{ParticipantId, RoomId};

use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging (RUST_LOG hat Vorrang)
pub fn init_logging() -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("roomcall_lib=debug,roomcall_relay=debug,webrtc=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .finish()
        .try_init()
}
