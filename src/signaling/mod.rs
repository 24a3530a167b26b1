//! Signaling Module - Relay und Teilnehmer-Verbindungen
//!
//! Dieses Modul verwaltet:
//! - Das Wire-Protokoll (JSON über WebSocket)
//! - Den RelayHub (Verbindungsregister + Room Directory)
//! - Den WebSocket Relay-Server und -Client
//! - Den In-Process Link für Tests und eingebettete Relays
//!

mod client;
mod link;
mod messages;
mod relay;
mod server;

pub use client::SignalingClient;
pub use link::{LocalLink, SignalingEvent, SignalingLink};
pub use messages::*;
pub use relay::{Relay, RelayHub, SignalingError};
pub use server::RelayServer;
