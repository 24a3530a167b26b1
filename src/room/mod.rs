//! Room Module - Raum- und Teilnehmerverzeichnis
//!
//! Dieses Modul verwaltet, welcher Teilnehmer in welchem Raum sitzt:
//! - Höchstens zwei Teilnehmer pro Raum
//! - Benachrichtigung des bestehenden Teilnehmers beim Beitritt eines Peers
//! - Aufräumen leerer Räume
//!

mod directory;

pub use directory::{DirectoryEvent, RoomDirectory, RoomError, ROOM_CAPACITY};

/// Vom Relay vergebene, opake Teilnehmer-ID (eine pro Verbindung)
pub type ParticipantId = String;

/// Vom Benutzer gewählte Raum-ID
pub type RoomId = String;
