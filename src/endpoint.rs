//! Endpoint - ein Teilnehmer mit Raum, Anruf und Medien
//!
//! Verbindet SignalingLink, Media Capture und Transport-Factory:
//! - Raumbeitritt und Verfolgung des anderen Teilnehmers
//! - Anruf starten, automatisch annehmen, beenden
//! - Tracks während eines Anrufs hinzufügen
//! - Beobachtbarer Anruf-Zustand und Events für die Oberfläche
//!
//! Pro Anrufversuch wird ein neuer `Call` mit frischem Transport gebaut.

use crate::call::{Call, CallError, CallEvent, CallState, TerminationReason};
use crate::media::{
    CaptureRequest, MediaCapture, MediaError, MediaKind, RemoteStream,
};
use crate::negotiation::{NegotiationError, TransportFactory};
use crate::room::{ParticipantId, RoomId};
use crate::signaling::{Envelope, Relay, Signal, SignalingError, SignalingEvent, SignalingLink};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 100;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Not in a room")]
    NotInRoom,

    #[error("No peer in the room")]
    NoPeer,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No active call")]
    NoActiveCall,

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

// ============================================================================
// ENDPOINT EVENTS
// ============================================================================

/// Events für die Oberfläche
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    /// Anderer Teilnehmer ist im Raum
    PeerJoined { participant_id: ParticipantId },

    /// Anderer Teilnehmer hat den Raum verlassen
    PeerLeft { participant_id: ParticipantId },

    /// Lokaler Stream (Vorschau)
    LocalStream {
        stream_id: String,
        track_ids: Vec<String>,
    },

    /// Remote-Stream hat sich geändert
    RemoteStream(RemoteStream),

    /// Anruf-Zustand hat sich geändert
    CallState(CallState),

    /// Anruf beendet
    CallEnded { reason: TerminationReason },

    /// Fehler, der keinen Aufrufer hat (z.B. beim automatischen Annehmen)
    Error(String),
}

// ============================================================================
// ENDPOINT
// ============================================================================

struct EndpointInner<L: SignalingLink> {
    link: Arc<L>,
    capture: Arc<dyn MediaCapture>,
    transports: Arc<dyn TransportFactory>,
    request: CaptureRequest,
    room_id: Mutex<Option<RoomId>>,
    remote_peer: Mutex<Option<ParticipantId>>,
    call: Mutex<Option<Arc<Call>>>,
    /// Serialisiert das Anlegen von Anrufen
    call_lock: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<CallState>,
    event_tx: broadcast::Sender<EndpointEvent>,
}

/// Ein Teilnehmer
pub struct Endpoint<L: SignalingLink + 'static> {
    inner: Arc<EndpointInner<L>>,
    pump: JoinHandle<()>,
}

impl<L: SignalingLink + 'static> Endpoint<L> {
    /// Erstellt einen Endpoint; muss innerhalb einer Tokio Runtime laufen
    pub fn new(
        link: Arc<L>,
        capture: Arc<dyn MediaCapture>,
        transports: Arc<dyn TransportFactory>,
        request: CaptureRequest,
    ) -> Self {
        let (state_tx, _) = watch::channel(CallState::Idle);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let signaling_rx = link.subscribe();
        let inner = Arc::new(EndpointInner {
            link,
            capture,
            transports,
            request,
            room_id: Mutex::new(None),
            remote_peer: Mutex::new(None),
            call: Mutex::new(None),
            call_lock: tokio::sync::Mutex::new(()),
            state_tx,
            event_tx,
        });

        let pump = spawn_signaling_pump(Arc::downgrade(&inner), signaling_rx);
        Self { inner, pump }
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.inner.link.participant_id()
    }

    pub fn link(&self) -> &Arc<L> {
        &self.inner.link
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.inner.room_id.lock().clone()
    }

    pub fn remote_peer(&self) -> Option<ParticipantId> {
        self.inner.remote_peer.lock().clone()
    }

    /// Aktueller (oder zuletzt beendeter) Anruf
    pub fn current_call(&self) -> Option<Arc<Call>> {
        self.inner.call.lock().clone()
    }

    /// Beobachtbarer Anruf-Zustand
    pub fn call_state(&self) -> watch::Receiver<CallState> {
        self.inner.state_tx.subscribe()
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Tritt einem Raum bei und merkt sich den anderen Teilnehmer
    ///
    /// Ein Wechsel in einen anderen Raum beendet den laufenden Anruf, ein
    /// abgelehnter Beitritt (Raum voll) lässt ihn bestehen.
    pub async fn join_room(&self, room_id: &str) -> Result<Vec<ParticipantId>, EndpointError> {
        let switching = self
            .inner
            .room_id
            .lock()
            .as_deref()
            .is_some_and(|current| current != room_id);

        let peers = self.inner.link.join_room(room_id).await?;

        if switching {
            if let Some(call) = self.inner.live_call() {
                tracing::info!("Switched to room {}, ending call {}", room_id, call.id());
                call.terminate(TerminationReason::LeftRoom).await;
            }
        }

        *self.inner.room_id.lock() = Some(room_id.to_string());
        *self.inner.remote_peer.lock() = peers.first().cloned();

        tracing::info!("Joined room {} (peers: {:?})", room_id, peers);
        Ok(peers)
    }

    /// Ruft den anderen Teilnehmer im Raum an
    pub async fn initiate_call(&self) -> Result<(), EndpointError> {
        if self.inner.room_id.lock().is_none() {
            return Err(EndpointError::NotInRoom);
        }
        let remote = self.remote_peer().ok_or(EndpointError::NoPeer)?;

        let call = {
            let _guard = self.inner.call_lock.lock().await;
            if self.inner.live_call().is_some() {
                return Err(EndpointError::AlreadyInCall);
            }
            EndpointInner::create_call(&self.inner, &remote).await?
        };

        tracing::info!("Calling {}", remote);
        call.initiate().await?;
        Ok(())
    }

    /// Legt auf
    pub async fn end_call(&self) -> Result<(), EndpointError> {
        let call = self.inner.live_call().ok_or(EndpointError::NoActiveCall)?;
        call.end().await;
        Ok(())
    }

    /// Fügt dem laufenden Anruf einen Track hinzu
    pub async fn add_track(&self, kind: MediaKind) -> Result<(), EndpointError> {
        let call = self.inner.live_call().ok_or(EndpointError::NoActiveCall)?;
        let stream_id = call
            .local_stream_id()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let track = self.inner.capture.acquire_track(kind, &stream_id)?;
        tracing::info!(
            "Adding {} track {} ({}) to call {}",
            kind,
            track.id(),
            track.label(),
            call.id()
        );
        call.add_local_tracks(vec![track]).await?;
        Ok(())
    }

    /// Verlässt den Raum; ein laufender Anruf wird beendet
    pub async fn leave_room(&self) -> Result<(), EndpointError> {
        if let Some(call) = self.inner.live_call() {
            call.terminate(TerminationReason::LeftRoom).await;
        }

        let room = self.inner.room_id.lock().take();
        self.inner.remote_peer.lock().take();

        if room.is_some() {
            self.inner.link.leave_room().await?;
            tracing::info!("Left room {:?}", room);
        }
        Ok(())
    }
}

impl<L: SignalingLink + 'static> Drop for Endpoint<L> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl<L: SignalingLink + 'static> std::fmt::Debug for Endpoint<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("participant_id", &self.participant_id())
            .field("room_id", &self.room_id())
            .field("remote_peer", &self.remote_peer())
            .field("call_state", &*self.inner.state_tx.borrow())
            .finish()
    }
}

// ============================================================================
// INNER
// ============================================================================

impl<L: SignalingLink + 'static> EndpointInner<L> {
    fn emit(&self, event: EndpointEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Anruf, der noch nicht beendet ist
    fn live_call(&self) -> Option<Arc<Call>> {
        self.call
            .lock()
            .as_ref()
            .filter(|call| !call.is_terminated())
            .cloned()
    }

    /// Baut einen Anruf: Medien holen, Transport anlegen, Pumps starten
    ///
    /// Erwartet gehaltenen `call_lock`.
    async fn create_call(
        this: &Arc<Self>,
        remote: &str,
    ) -> Result<Arc<Call>, EndpointError> {
        let stream = this.capture.acquire(&this.request)?;
        let transport = this.transports.create().await?;

        let relay: Arc<dyn Relay> = this.link.clone();
        let call = Arc::new(Call::new(
            &this.link.participant_id(),
            remote,
            transport,
            relay,
        ));

        spawn_call_bridge(Arc::downgrade(this), &call);
        call.spawn_transport_pump();

        *this.call.lock() = Some(Arc::clone(&call));
        this.state_tx.send_replace(CallState::Idle);

        if let Err(e) = call.attach_local_stream(stream).await {
            call.terminate(TerminationReason::TransportFailed(e.to_string()))
                .await;
            return Err(e.into());
        }
        Ok(call)
    }

    /// Verarbeitet ein Event des SignalingLinks
    async fn handle_signaling_event(this: &Arc<Self>, event: SignalingEvent) {
        match event {
            SignalingEvent::PeerJoined { participant_id } => {
                tracing::info!("Peer {} joined the room", participant_id);
                *this.remote_peer.lock() = Some(participant_id.clone());
                this.emit(EndpointEvent::PeerJoined { participant_id });
            }

            SignalingEvent::PeerLeft { participant_id } => {
                tracing::info!("Peer {} left the room", participant_id);
                {
                    let mut remote = this.remote_peer.lock();
                    if remote.as_deref() == Some(participant_id.as_str()) {
                        *remote = None;
                    }
                }
                if let Some(call) = this.live_call() {
                    if call.remote_id() == participant_id {
                        call.terminate(TerminationReason::PeerLeft).await;
                    }
                }
                this.emit(EndpointEvent::PeerLeft { participant_id });
            }

            SignalingEvent::Envelope(envelope) => {
                Self::handle_envelope(this, envelope).await;
            }

            SignalingEvent::DeliveryFailed { to } => {
                tracing::warn!("Relay could not deliver to {}", to);
                if let Some(call) = this.live_call() {
                    if call.remote_id() == to {
                        call.terminate(TerminationReason::DeliveryFailed).await;
                    }
                }
            }

            SignalingEvent::Disconnected => {
                tracing::info!("Disconnected from relay");
                if let Some(call) = this.live_call() {
                    call.terminate(TerminationReason::SignalingLost).await;
                }
                this.room_id.lock().take();
                this.remote_peer.lock().take();
            }

            SignalingEvent::Error { code, message } => {
                tracing::error!("Relay error {}: {}", code, message);
                this.emit(EndpointEvent::Error(format!("{} - {}", code, message)));
            }

            SignalingEvent::Connected { .. }
            | SignalingEvent::RoomJoined { .. }
            | SignalingEvent::RoomFull { .. } => {}
        }
    }

    /// Leitet Envelopes an den Anruf; ein neues Offer wird automatisch angenommen
    async fn handle_envelope(this: &Arc<Self>, envelope: Envelope) {
        let call = match this.live_call() {
            Some(call) => call,
            None => match envelope.signal {
                Signal::CallOffer(_) => match Self::accept_incoming(this, &envelope.from).await {
                    Some(call) => call,
                    None => return,
                },
                _ => {
                    tracing::debug!(
                        "Ignoring {} from {} without a call",
                        envelope.signal.name(),
                        envelope.from
                    );
                    return;
                }
            },
        };

        if let Err(e) = call.handle_envelope(envelope).await {
            tracing::warn!("Call {} rejected envelope: {}", call.id(), e);
            if !matches!(e, CallError::Terminated) {
                this.emit(EndpointEvent::Error(e.to_string()));
            }
        }
    }

    /// Baut den Anruf für ein eingehendes Offer
    async fn accept_incoming(this: &Arc<Self>, from: &str) -> Option<Arc<Call>> {
        let _guard = this.call_lock.lock().await;
        if let Some(call) = this.live_call() {
            return Some(call);
        }

        tracing::info!("Incoming call from {}", from);
        this.remote_peer.lock().get_or_insert_with(|| from.to_string());

        match Self::create_call(this, from).await {
            Ok(call) => Some(call),
            Err(e) => {
                tracing::error!("Could not accept call from {}: {}", from, e);
                this.emit(EndpointEvent::Error(e.to_string()));

                // Anrufer nicht hängen lassen
                let hangup = Envelope::new(&this.link.participant_id(), from, Signal::Hangup);
                if let Err(e) = this.link.send(hangup) {
                    tracing::debug!("Hangup to {} not delivered: {}", from, e);
                }
                None
            }
        }
    }
}

// ============================================================================
// PUMPS
// ============================================================================

/// Leitet SignalingLink-Events in den Endpoint
fn spawn_signaling_pump<L: SignalingLink + 'static>(
    inner: Weak<EndpointInner<L>>,
    mut events: broadcast::Receiver<SignalingEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Endpoint missed {} signaling events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let Some(inner) = inner.upgrade() else {
                break;
            };
            EndpointInner::handle_signaling_event(&inner, event).await;
        }
    })
}

/// Spiegelt Call-Events in Endpoint-Zustand und -Events
fn spawn_call_bridge<L: SignalingLink + 'static>(
    inner: Weak<EndpointInner<L>>,
    call: &Arc<Call>,
) -> JoinHandle<()> {
    let mut events = call.subscribe();
    let call_id = call.id().to_string();

    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Endpoint missed {} call events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let Some(inner) = inner.upgrade() else {
                break;
            };

            let is_current = inner
                .call
                .lock()
                .as_ref()
                .map(|current| current.id() == call_id)
                .unwrap_or(false);

            match event {
                CallEvent::StateChanged(state) => {
                    if is_current {
                        inner.state_tx.send_replace(state);
                    }
                    inner.emit(EndpointEvent::CallState(state));
                }
                CallEvent::LocalStream {
                    stream_id,
                    track_ids,
                } => inner.emit(EndpointEvent::LocalStream {
                    stream_id,
                    track_ids,
                }),
                CallEvent::RemoteStream(stream) => inner.emit(EndpointEvent::RemoteStream(stream)),
                CallEvent::Terminated { reason } => {
                    tracing::info!("Call ended: {}", reason);
                    inner.emit(EndpointEvent::CallEnded { reason });
                    break;
                }
            }
        }

        tracing::debug!("Call bridge of {} stopped", call_id);
    })
}

// ============================================================================
// TESTS
// ============================================================================
