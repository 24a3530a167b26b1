//! WebRTC Transport
//!
//! MediaTransport auf Basis einer `RTCPeerConnection` aus webrtc-rs.
//! ICE Candidates werden nicht einzeln signalisiert: `set_local_description`
//! wartet auf das Ende des Gatherings, damit das SDP alle Candidates enthält.

use super::description::{SdpType, SessionDescription};
use super::transport::{MediaTransport, NegotiationError, TransportEvent, TransportFactory};
use crate::config::IceServerConfig;
use crate::media::{LocalTrack, MediaKind, RemoteTrack};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const EVENT_CAPACITY: usize = 100;

fn transport_error(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Transport(e.to_string())
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server (wie im Browser-Client)
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:global.stun.twilio.com:3478".to_string(),
        ],
        ..Default::default()
    }]
}

fn to_rtc_ice_server(server: &IceServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

// ============================================================================
// WEBRTC TRANSPORT
// ============================================================================

/// Angehängter lokaler Track; wird beim Neuaufbau erneut hinzugefügt
#[derive(Debug, Clone)]
struct SenderSpec {
    kind: MediaKind,
    track_id: String,
    stream_id: String,
}

/// Transport-Session über eine echte Peer Connection
///
/// webrtc-rs kennt kein Rollback. Trifft ein fremdes Offer auf ein eigenes
/// offenes Offer, bevor je eine Remote-Beschreibung gesetzt wurde, wird die
/// Peer Connection verworfen und mit denselben Tracks neu aufgebaut. Danach
/// schlägt so ein Offer mit `RollbackUnsupported` fehl.
pub struct WebRtcTransport {
    api: API,
    config: RTCConfiguration,
    peer_connection: Mutex<Arc<RTCPeerConnection>>,
    senders: Mutex<Vec<SenderSpec>>,
    remote_applied: AtomicBool,
    event_tx: broadcast::Sender<TransportEvent>,
}

impl WebRtcTransport {
    /// Erstellt eine neue Peer Connection mit den gegebenen ICE Servern
    pub async fn connect(ice_servers: Vec<RTCIceServer>) -> Result<Self, NegotiationError> {
        // Media Engine mit Standard-Codecs (Opus, VP8, ...)
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(transport_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(transport_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let peer_connection = Self::open(&api, &config, &event_tx).await?;

        Ok(Self {
            api,
            config,
            peer_connection: Mutex::new(peer_connection),
            senders: Mutex::new(Vec::new()),
            remote_applied: AtomicBool::new(false),
            event_tx,
        })
    }

    async fn open(
        api: &API,
        config: &RTCConfiguration,
        event_tx: &broadcast::Sender<TransportEvent>,
    ) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        let peer_connection = Arc::new(
            api.new_peer_connection(config.clone())
                .await
                .map_err(transport_error)?,
        );
        Self::register_handlers(&peer_connection, event_tx);
        Ok(peer_connection)
    }

    fn pc(&self) -> Arc<RTCPeerConnection> {
        self.peer_connection.lock().clone()
    }

    /// Registriert Event Handler für die Peer Connection
    fn register_handlers(
        pc: &Arc<RTCPeerConnection>,
        event_tx: &broadcast::Sender<TransportEvent>,
    ) {
        let tx = event_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);

            let event = match s {
                RTCPeerConnectionState::Connected => Some(TransportEvent::Connected),
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => Some(
                    TransportEvent::ConnectionFailed(format!("peer connection {}", s)),
                ),
                _ => None,
            };
            if let Some(event) = event {
                let _ = tx.send(event);
            }

            Box::pin(async {})
        }));

        let tx = event_tx.clone();
        pc.on_negotiation_needed(Box::new(move || {
            tracing::debug!("Negotiation needed");
            let _ = tx.send(TransportEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        let tx = event_tx.clone();
        pc.on_track(Box::new(move |track, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Video => MediaKind::Video,
                _ => MediaKind::Audio,
            };
            let stream_id = track.stream_id();
            let remote = RemoteTrack {
                id: track.id(),
                kind,
                stream_id: (!stream_id.is_empty()).then_some(stream_id),
            };
            tracing::info!("Received remote {} track {}", remote.kind, remote.id);
            let _ = tx.send(TransportEvent::RemoteTrack(remote));
            Box::pin(async {})
        }));
    }

    /// Ersetzt die Peer Connection durch eine frische mit denselben Tracks
    async fn rebuild(&self) -> Result<(), NegotiationError> {
        let fresh = Self::open(&self.api, &self.config, &self.event_tx).await?;

        let senders = self.senders.lock().clone();
        for spec in &senders {
            Self::add_sender(&fresh, spec).await?;
        }

        let old = std::mem::replace(&mut *self.peer_connection.lock(), fresh);

        // Das Schließen der alten Verbindung ist kein Verbindungsabbruch
        old.on_peer_connection_state_change(Box::new(|_: RTCPeerConnectionState| Box::pin(async {})));
        old.on_negotiation_needed(Box::new(|| Box::pin(async {})));
        if let Err(e) = old.close().await {
            tracing::debug!("Closing discarded peer connection failed: {}", e);
        }

        tracing::info!("Rebuilt peer connection with {} tracks", senders.len());
        Ok(())
    }

    async fn add_sender(pc: &RTCPeerConnection, spec: &SenderSpec) -> Result<(), NegotiationError> {
        let local = Arc::new(TrackLocalStaticSample::new(
            Self::codec_for(spec.kind),
            spec.track_id.clone(),
            spec.stream_id.clone(),
        ));

        pc.add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(transport_error)?;
        Ok(())
    }

    fn to_rtc_description(
        description: &SessionDescription,
    ) -> Result<RTCSessionDescription, NegotiationError> {
        let sdp = description.sdp.clone();
        match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(sdp),
            SdpType::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(|e| NegotiationError::InvalidSdp(e.to_string()))
    }

    fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
        match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<String, NegotiationError> {
        let offer = self
            .pc()
            .create_offer(None)
            .await
            .map_err(transport_error)?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, NegotiationError> {
        let answer = self
            .pc()
            .create_answer(None)
            .await
            .map_err(transport_error)?;
        Ok(answer.sdp)
    }

    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<String, NegotiationError> {
        let rtc = Self::to_rtc_description(description)?;
        let pc = self.pc();
        let mut gather_complete = pc.gathering_complete_promise().await;

        pc.set_local_description(rtc)
            .await
            .map_err(transport_error)?;

        let _ = gather_complete.recv().await;

        // Nach dem Gathering enthält die lokale Beschreibung alle Candidates
        Ok(pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .unwrap_or_else(|| description.sdp.clone()))
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        let rtc = Self::to_rtc_description(description)?;

        // Glare: eigenes offenes Offer aufgeben
        if description.is_offer()
            && self.pc().signaling_state() == RTCSignalingState::HaveLocalOffer
        {
            if self.remote_applied.load(Ordering::SeqCst) {
                return Err(NegotiationError::RollbackUnsupported);
            }
            tracing::debug!("Discarding local offer for remote offer");
            self.rebuild().await?;
        }

        self.pc()
            .set_remote_description(rtc)
            .await
            .map_err(transport_error)?;
        self.remote_applied.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        let spec = SenderSpec {
            kind: track.kind(),
            track_id: track.id().to_string(),
            stream_id: track.stream_id().to_string(),
        };

        Self::add_sender(&self.pc(), &spec).await?;
        self.senders.lock().push(spec);
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.senders.lock().clear();
        self.pc().close().await.map_err(transport_error)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }
}

impl std::fmt::Debug for WebRtcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransport")
            .field("state", &self.pc().connection_state())
            .field("senders", &self.senders.lock().len())
            .finish()
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Factory für WebRTC-Sessions
#[derive(Debug, Clone)]
pub struct WebRtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcTransportFactory {
    pub fn new() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }

    /// Übernimmt zusätzliche (z.B. TURN) Server aus der Konfiguration
    pub fn with_ice_servers(servers: &[IceServerConfig]) -> Self {
        let mut factory = Self::new();
        factory
            .ice_servers
            .extend(servers.iter().map(to_rtc_ice_server));
        factory
    }
}

impl Default for WebRtcTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self) -> Result<Arc<dyn MediaTransport>, NegotiationError> {
        let transport = WebRtcTransport::connect(self.ice_servers.clone()).await?;
        Ok(Arc::new(transport))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{Call, CallState};
    use crate::negotiation::{AnswerOutcome, Negotiator};
    use crate::signaling::{Envelope, Relay, SignalingError};

    /// Sammelt gesendete Envelopes zum manuellen Zustellen
    #[derive(Default)]
    struct Mailbox(Mutex<Vec<Envelope>>);

    impl Mailbox {
        fn take(&self) -> Envelope {
            self.0.lock().pop().expect("nothing was sent")
        }
    }

    impl Relay for Mailbox {
        fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
            self.0.lock().push(envelope);
            Ok(())
        }
    }

    /// Nur Host Candidates, kein STUN
    async fn transport() -> Arc<WebRtcTransport> {
        Arc::new(WebRtcTransport::connect(Vec::new()).await.unwrap())
    }

    fn track(kind: MediaKind) -> LocalTrack {
        LocalTrack::new(kind, "stream-1", "test", || {})
    }

    async fn connected_pair() -> (Negotiator, Negotiator, Arc<WebRtcTransport>) {
        let a = transport().await;
        let caller = Negotiator::new(a.clone());
        let callee = Negotiator::new(transport().await);

        caller.attach_tracks(&[track(MediaKind::Audio)]).await.unwrap();
        let offer = caller.create_offer().await.unwrap();
        let answer = callee.create_answer(&offer).await.unwrap();
        assert_eq!(
            caller.apply_remote_answer(&answer).await.unwrap(),
            AnswerOutcome::Applied
        );
        (caller, callee, a)
    }

    #[tokio::test]
    async fn test_offer_answer_between_peer_connections() {
        let (caller, _callee, a) = connected_pair().await;

        assert_eq!(caller.pending_offer(), None);
        assert_eq!(a.pc().signaling_state(), RTCSignalingState::Stable);
        assert!(a.pc().remote_description().await.is_some());
    }

    #[tokio::test]
    async fn test_renegotiation_adds_video_section() {
        let (caller, callee, a) = connected_pair().await;

        caller.attach_tracks(&[track(MediaKind::Video)]).await.unwrap();
        let offer = caller.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        let answer = callee.create_answer(&offer).await.unwrap();
        assert!(answer.sdp.contains("m=video"));
        assert_eq!(
            caller.apply_remote_answer(&answer).await.unwrap(),
            AnswerOutcome::Applied
        );
        assert_eq!(a.pc().signaling_state(), RTCSignalingState::Stable);
    }

    #[tokio::test]
    async fn test_initial_glare_rebuilds_and_answers() {
        let a = transport().await;
        let b = transport().await;
        let greater = Negotiator::new(a.clone());
        let lesser = Negotiator::new(b.clone());
        greater.attach_tracks(&[track(MediaKind::Audio)]).await.unwrap();
        lesser.attach_tracks(&[track(MediaKind::Video)]).await.unwrap();

        let offer_a = greater.create_offer().await.unwrap();
        let _offer_b = lesser.create_offer().await.unwrap();

        let answer = lesser.create_answer(&offer_a).await.unwrap();
        assert_eq!(lesser.pending_offer(), None);
        assert!(answer.sdp.contains("m=audio"));
        // Der Neuaufbau behält den eigenen Track
        assert_eq!(b.senders.lock().len(), 1);
        assert!(!b.pc().get_senders().await.is_empty());

        assert_eq!(
            greater.apply_remote_answer(&answer).await.unwrap(),
            AnswerOutcome::Applied
        );
        assert_eq!(a.pc().signaling_state(), RTCSignalingState::Stable);
        assert_eq!(b.pc().signaling_state(), RTCSignalingState::Stable);
    }

    #[tokio::test]
    async fn test_glare_after_connect_is_refused() {
        let (caller, callee, _) = connected_pair().await;

        callee.attach_tracks(&[track(MediaKind::Video)]).await.unwrap();
        let offer_a = caller.create_offer().await.unwrap();
        callee.create_offer().await.unwrap();

        assert_eq!(
            callee.create_answer(&offer_a).await.unwrap_err(),
            NegotiationError::RollbackUnsupported
        );
    }

    #[tokio::test]
    async fn test_calls_connect_over_peer_connections() {
        let caller_box = Arc::new(Mailbox::default());
        let callee_box = Arc::new(Mailbox::default());
        let caller = Call::new("a", "b", transport().await, caller_box.clone());
        let callee = Call::new("b", "a", transport().await, callee_box.clone());
        caller
            .add_local_tracks(vec![track(MediaKind::Audio)])
            .await
            .unwrap();
        callee
            .add_local_tracks(vec![track(MediaKind::Audio)])
            .await
            .unwrap();

        caller.initiate().await.unwrap();
        callee.handle_envelope(caller_box.take()).await.unwrap();
        assert_eq!(callee.state(), CallState::Connected);
        caller.handle_envelope(callee_box.take()).await.unwrap();
        assert_eq!(caller.state(), CallState::Connected);

        // Neuverhandlung mit einem Video-Track
        caller
            .add_local_tracks(vec![track(MediaKind::Video)])
            .await
            .unwrap();
        caller.on_renegotiation_needed().await.unwrap();
        assert_eq!(caller.state(), CallState::Negotiating);
        callee.handle_envelope(caller_box.take()).await.unwrap();
        caller.handle_envelope(callee_box.take()).await.unwrap();
        assert_eq!(caller.state(), CallState::Connected);
        assert_eq!(callee.state(), CallState::Connected);

        caller.end().await;
        assert!(caller.negotiator().is_closed());
    }

    #[test]
    fn test_turn_servers_are_appended() {
        let factory = WebRtcTransportFactory::with_ice_servers(&[IceServerConfig {
            urls: vec!["turn:turn.example.org:3478".to_string()],
            username: Some("user".to_string()),
            credential: Some("secret".to_string()),
        }]);

        assert_eq!(factory.ice_servers.len(), 2);
        assert_eq!(factory.ice_servers[1].username, "user");
    }

    #[test]
    fn test_codec_for_kind() {
        assert_eq!(
            WebRtcTransport::codec_for(MediaKind::Audio).mime_type,
            MIME_TYPE_OPUS
        );
        assert_eq!(
            WebRtcTransport::codec_for(MediaKind::Video).mime_type,
            MIME_TYPE_VP8
        );
    }
}
