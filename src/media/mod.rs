//! Media Module - Lokale und entfernte Tracks
//!
//! Dieses Modul verwaltet:
//! - Lokale Tracks (exklusiv im Besitz des Anrufs, der sie aufnimmt)
//! - Media Capture (Geräte-Zugriff, optional über cpal)
//! - Den zusammengesetzten Remote-Stream
//!

mod capture;
#[cfg(feature = "audio-device")]
mod microphone;
mod remote;
mod track;

pub use capture::{CaptureRequest, MediaCapture, MediaError, SyntheticCapture};
#[cfg(feature = "audio-device")]
pub use microphone::MicrophoneCapture;
pub use remote::{RemoteStream, RemoteTrack};
pub use track::{LocalStream, LocalTrack, MediaKind};
