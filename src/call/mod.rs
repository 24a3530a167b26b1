//! Call Module - Zustandsmaschine pro Anruf
//!
//! Dieses Modul verwaltet:
//! - Den Anruf-Zustand (Idle → Offering/Answering → Connected ⇄ Negotiating)
//! - Offer/Answer-Austausch über den Relay
//! - Neuverhandlung bei geänderten Tracks
//! - Das Beenden mit Freigabe der lokalen Geräte
//!

mod machine;
mod state;

pub use machine::Call;
pub use state::{CallError, CallEvent, CallState, TerminationReason};
