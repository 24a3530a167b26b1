//! Negotiation Module - Offer/Answer pro Anruf
//!
//! Dieses Modul verwaltet:
//! - Session Descriptions mit Revisionszähler
//! - Die Transport-Schnittstelle (WebRTC oder Loopback)
//! - Den Negotiator, der genau eine Transport-Session kapselt
//!

mod description;
mod loopback;
mod negotiator;
mod transport;
mod webrtc;

pub use description::{SdpType, SessionDescription};
pub use loopback::{LoopbackTransport, LoopbackTransportFactory};
pub use negotiator::{AnswerOutcome, Negotiator};
pub use transport::{MediaTransport, NegotiationError, TransportEvent, TransportFactory};
pub use webrtc::{default_ice_servers, WebRtcTransport, WebRtcTransportFactory};
