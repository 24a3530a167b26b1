//! Loopback Transport
//!
//! Deterministische In-Memory-Engine ohne Netzwerk. Das SDP listet die
//! lokalen Tracks als `a=track:<kind> <stream> <id>` Zeilen; beim Setzen einer
//! entfernten Beschreibung werden neue Tracks als `RemoteTrack` gemeldet.

use super::description::{SdpType, SessionDescription};
use super::transport::{MediaTransport, NegotiationError, TransportEvent, TransportFactory};
use crate::media::{LocalTrack, MediaKind, RemoteTrack};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 100;
const TRACK_PREFIX: &str = "a=track:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Debug)]
struct LoopbackState {
    session_id: String,
    version: u64,
    local_tracks: Vec<RemoteTrack>,
    remote_seen: HashSet<String>,
    signaling: SignalingState,
    established: bool,
    /// Lokale Tracks, die in keiner erzeugten Beschreibung stehen
    dirty: bool,
    closed: bool,
}

/// In-Memory Transport-Session
pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
    event_tx: broadcast::Sender<TransportEvent>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            state: Mutex::new(LoopbackState {
                session_id: uuid::Uuid::new_v4().simple().to_string(),
                version: 0,
                local_tracks: Vec::new(),
                remote_seen: HashSet::new(),
                signaling: SignalingState::Stable,
                established: false,
                dirty: false,
                closed: false,
            }),
            event_tx,
        }
    }

    pub fn local_track_count(&self) -> usize {
        self.state.lock().local_tracks.len()
    }

    pub fn is_established(&self) -> bool {
        self.state.lock().established
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Simuliert einen Verbindungsabbruch
    pub fn fail(&self, reason: &str) {
        let _ = self
            .event_tx
            .send(TransportEvent::ConnectionFailed(reason.to_string()));
    }

    fn render(state: &mut LoopbackState) -> String {
        state.version += 1;
        state.dirty = false;
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=roomcall\r\nt=0 0\r\n",
            state.session_id, state.version
        );
        for track in &state.local_tracks {
            sdp.push_str(&format!(
                "{}{} {} {}\r\n",
                TRACK_PREFIX,
                track.kind,
                track.stream_id.as_deref().unwrap_or("-"),
                track.id
            ));
        }
        sdp
    }

    fn parse_tracks(sdp: &str) -> Result<Vec<RemoteTrack>, NegotiationError> {
        if !sdp.starts_with("v=0") {
            return Err(NegotiationError::InvalidSdp("missing version line".to_string()));
        }

        sdp.lines()
            .filter_map(|line| line.strip_prefix(TRACK_PREFIX))
            .map(|rest| {
                let mut parts = rest.split_whitespace();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(kind), Some(stream), Some(id)) => {
                        let kind = MediaKind::parse(kind).ok_or_else(|| {
                            NegotiationError::InvalidSdp(format!("unknown media kind {}", kind))
                        })?;
                        Ok(RemoteTrack {
                            id: id.to_string(),
                            kind,
                            stream_id: (stream != "-").then(|| stream.to_string()),
                        })
                    }
                    _ => Err(NegotiationError::InvalidSdp(format!(
                        "malformed track line: {}",
                        rest
                    ))),
                }
            })
            .collect()
    }

    fn ensure_open(state: &LoopbackState) -> Result<(), NegotiationError> {
        if state.closed {
            return Err(NegotiationError::Closed);
        }
        Ok(())
    }

    /// Rückkehr nach Stable nach einem Offer/Answer-Zyklus
    fn settle(&self, state: &mut LoopbackState) {
        state.signaling = SignalingState::Stable;
        if !state.established {
            state.established = true;
            let _ = self.event_tx.send(TransportEvent::Connected);
        }
        if state.dirty {
            let _ = self.event_tx.send(TransportEvent::NegotiationNeeded);
        }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<String, NegotiationError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        Ok(Self::render(&mut state))
    }

    async fn create_answer(&self) -> Result<String, NegotiationError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(NegotiationError::Transport(
                "cannot answer without a remote offer".to_string(),
            ));
        }
        Ok(Self::render(&mut state))
    }

    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<String, NegotiationError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;

        match description.sdp_type {
            SdpType::Offer => state.signaling = SignalingState::HaveLocalOffer,
            SdpType::Answer => {
                if state.signaling != SignalingState::HaveRemoteOffer {
                    return Err(NegotiationError::Transport(
                        "local answer without remote offer".to_string(),
                    ));
                }
                self.settle(&mut state);
            }
        }
        Ok(description.sdp.clone())
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        let tracks = Self::parse_tracks(&description.sdp)?;

        let mut state = self.state.lock();
        Self::ensure_open(&state)?;

        match description.sdp_type {
            SdpType::Offer => {
                if state.signaling == SignalingState::HaveLocalOffer {
                    tracing::debug!("Remote offer replaces pending local offer");
                }
                state.signaling = SignalingState::HaveRemoteOffer;
            }
            SdpType::Answer => {
                if state.signaling != SignalingState::HaveLocalOffer {
                    return Err(NegotiationError::Transport(
                        "remote answer without local offer".to_string(),
                    ));
                }
                self.settle(&mut state);
            }
        }

        for track in tracks {
            if state.remote_seen.insert(track.id.clone()) {
                let _ = self.event_tx.send(TransportEvent::RemoteTrack(track));
            }
        }
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;

        state.local_tracks.push(RemoteTrack {
            id: track.id().to_string(),
            kind: track.kind(),
            stream_id: Some(track.stream_id().to_string()),
        });

        state.dirty = true;
        if state.established && state.signaling == SignalingState::Stable {
            let _ = self.event_tx.send(TransportEvent::NegotiationNeeded);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.state.lock().closed = true;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("state", &*self.state.lock())
            .finish()
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Factory für Loopback-Sessions, merkt sich alle erzeugten Sessions
#[derive(Debug, Default)]
pub struct LoopbackTransportFactory {
    created: Mutex<Vec<Arc<LoopbackTransport>>>,
}

impl LoopbackTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zuletzt erzeugte Session
    pub fn last(&self) -> Option<Arc<LoopbackTransport>> {
        self.created.lock().last().cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl TransportFactory for LoopbackTransportFactory {
    async fn create(&self) -> Result<Arc<dyn MediaTransport>, NegotiationError> {
        let transport = Arc::new(LoopbackTransport::new());
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_negotiation_needed_only_after_established() {
        let transport = LoopbackTransport::new();
        let mut events = transport.subscribe();
        let track = LocalTrack::new(MediaKind::Audio, "s1", "mic", || {});

        transport.add_track(&track).await.unwrap();
        assert!(events.try_recv().is_err());

        transport
            .set_remote_description(&SessionDescription::offer("v=0\r\n".to_string(), 1))
            .await
            .unwrap();
        let answer = transport.create_answer().await.unwrap();
        transport
            .set_local_description(&SessionDescription::answer(answer, 1))
            .await
            .unwrap();
        assert_eq!(events.try_recv().unwrap(), TransportEvent::Connected);

        let second = LocalTrack::new(MediaKind::Video, "s1", "cam", || {});
        transport.add_track(&second).await.unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            TransportEvent::NegotiationNeeded
        );
    }

    #[tokio::test]
    async fn test_track_added_mid_offer_renegotiates_when_stable() {
        let caller = LoopbackTransport::new();
        let callee = LoopbackTransport::new();
        let mut events = caller.subscribe();

        let offer = SessionDescription::offer(caller.create_offer().await.unwrap(), 1);
        caller.set_local_description(&offer).await.unwrap();

        let late = LocalTrack::new(MediaKind::Video, "s1", "cam", || {});
        caller.add_track(&late).await.unwrap();

        callee.set_remote_description(&offer).await.unwrap();
        let answer = SessionDescription::answer(callee.create_answer().await.unwrap(), 1);
        callee.set_local_description(&answer).await.unwrap();
        caller.set_remote_description(&answer).await.unwrap();

        assert_eq!(events.try_recv().unwrap(), TransportEvent::Connected);
        assert_eq!(
            events.try_recv().unwrap(),
            TransportEvent::NegotiationNeeded
        );
    }

    #[tokio::test]
    async fn test_rejects_answer_without_offer() {
        let transport = LoopbackTransport::new();
        let result = transport
            .set_remote_description(&SessionDescription::answer("v=0\r\n".to_string(), 1))
            .await;
        assert!(matches!(result, Err(NegotiationError::Transport(_))));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(LoopbackTransport::parse_tracks("hello").is_err());
        assert!(LoopbackTransport::parse_tracks("v=0\r\na=track:smell s id\r\n").is_err());
    }

    #[tokio::test]
    async fn test_factory_tracks_sessions() {
        let factory = LoopbackTransportFactory::new();
        factory.create().await.unwrap();
        factory.create().await.unwrap();
        assert_eq!(factory.created_count(), 2);
        assert!(factory.last().is_some());
    }
}
