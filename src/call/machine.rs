//! Call State Machine
//!
//! Ein `Call` bindet genau ein Teilnehmerpaar (lokal, entfernt) und genau
//! einen Negotiator. Verhandlungsschritte laufen nacheinander (async Mutex);
//! `terminate` nimmt diesen Lock nicht und darf jederzeit laufen.
//!
//! ```text
//! Idle ──initiate──▶ Offering ──call:answer──▶ Connected ◀──┐
//!   └──call:offer──▶ Answering ────────────────▶    │        │
//!                                    negotiation needed      │
//!                                                   ▼        │
//!                                         Negotiating ─answer┘
//! ```

use super::state::{CallError, CallEvent, CallState, TerminationReason};
use crate::media::{LocalStream, LocalTrack, RemoteStream};
use crate::negotiation::{
    AnswerOutcome, MediaTransport, NegotiationError, Negotiator, SessionDescription,
    TransportEvent,
};
use crate::room::ParticipantId;
use crate::signaling::{Envelope, Relay, Signal, SignalingError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 100;

#[derive(Debug)]
struct CallInner {
    state: CallState,
    /// Neuverhandlung angefordert, während eine andere lief
    renegotiation_queued: bool,
    connected_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

/// Ein Anruf zwischen zwei Teilnehmern eines Raums
pub struct Call {
    id: String,
    local_id: ParticipantId,
    remote_id: ParticipantId,
    created_at: DateTime<Utc>,
    negotiator: Negotiator,
    relay: Arc<dyn Relay>,
    inner: Mutex<CallInner>,
    local_stream: Mutex<Option<LocalStream>>,
    remote_stream: Mutex<RemoteStream>,
    op_lock: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<CallState>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl Call {
    pub fn new(
        local_id: &str,
        remote_id: &str,
        transport: Arc<dyn MediaTransport>,
        relay: Arc<dyn Relay>,
    ) -> Self {
        let (state_tx, _) = watch::channel(CallState::Idle);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let id = uuid::Uuid::new_v4().to_string();

        tracing::info!("Created call {} ({} -> {})", id, local_id, remote_id);

        Self {
            id,
            local_id: local_id.to_string(),
            remote_id: remote_id.to_string(),
            created_at: Utc::now(),
            negotiator: Negotiator::new(transport),
            relay,
            inner: Mutex::new(CallInner {
                state: CallState::Idle,
                renegotiation_queued: false,
                connected_at: None,
                ended_at: None,
            }),
            local_stream: Mutex::new(None),
            remote_stream: Mutex::new(RemoteStream::new()),
            op_lock: tokio::sync::Mutex::new(()),
            state_tx,
            event_tx,
        }
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().connected_at
    }

    /// Dauer seit Verbindungsaufbau (bis zum Ende, falls beendet)
    pub fn duration(&self) -> Option<chrono::Duration> {
        let inner = self.inner.lock();
        let start = inner.connected_at?;
        Some(inner.ended_at.unwrap_or_else(Utc::now) - start)
    }

    pub fn state(&self) -> CallState {
        self.inner.lock().state
    }

    pub fn is_terminated(&self) -> bool {
        self.state().is_terminated()
    }

    /// Beobachtbarer Zustand
    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state_tx.subscribe()
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Kopie des zusammengesetzten Remote-Streams
    pub fn remote_stream(&self) -> RemoteStream {
        self.remote_stream.lock().clone()
    }

    pub fn local_stream_id(&self) -> Option<String> {
        self.local_stream
            .lock()
            .as_ref()
            .map(|stream| stream.id().to_string())
    }

    /// IDs der lokalen Tracks
    pub fn local_track_ids(&self) -> Vec<String> {
        self.local_stream
            .lock()
            .as_ref()
            .map(LocalStream::track_ids)
            .unwrap_or_default()
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    // ========================================================================
    // LOCAL MEDIA
    // ========================================================================

    /// Übernimmt einen lokalen Stream und hängt seine Tracks an
    ///
    /// Ist schon ein Stream angehängt, werden nur dessen neue Tracks ergänzt.
    pub async fn attach_local_stream(&self, stream: LocalStream) -> Result<usize, CallError> {
        self.ensure_live()?;

        let tracks = stream.tracks().to_vec();
        {
            let mut local = self.local_stream.lock();
            match local.as_mut() {
                Some(existing) => {
                    for track in stream.into_tracks() {
                        existing.add_track(track);
                    }
                }
                None => *local = Some(stream),
            }
        }

        self.attach(tracks).await
    }

    /// Fügt Tracks zum lokalen Stream hinzu (löst ggf. Neuverhandlung aus)
    pub async fn add_local_tracks(&self, tracks: Vec<LocalTrack>) -> Result<usize, CallError> {
        if self.is_terminated() {
            tracks.iter().for_each(LocalTrack::stop);
            return Err(CallError::Terminated);
        }

        {
            let mut local = self.local_stream.lock();
            let stream = local.get_or_insert_with(|| {
                let stream_id = tracks
                    .first()
                    .map(|t| t.stream_id().to_string())
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                LocalStream::new(stream_id)
            });
            for track in &tracks {
                stream.add_track(track.clone());
            }
        }

        self.attach(tracks).await
    }

    async fn attach(&self, tracks: Vec<LocalTrack>) -> Result<usize, CallError> {
        let added = match self.negotiator.attach_tracks(&tracks).await {
            Ok(added) => added,
            Err(e) => {
                // Nach einem Abbruch gehören die Tracks niemandem mehr
                if self.is_terminated() {
                    tracks.iter().for_each(LocalTrack::stop);
                }
                return Err(e.into());
            }
        };

        if self.is_terminated() {
            tracks.iter().for_each(LocalTrack::stop);
            return Err(CallError::Terminated);
        }

        if let Some(stream_id) = self.local_stream_id() {
            let _ = self.event_tx.send(CallEvent::LocalStream {
                stream_id,
                track_ids: self.local_track_ids(),
            });
        }
        Ok(added)
    }

    // ========================================================================
    // NEGOTIATION
    // ========================================================================

    /// Startet den Anruf: Offer erzeugen und senden
    pub async fn initiate(&self) -> Result<(), CallError> {
        let _guard = self.op_lock.lock().await;
        self.expect_state(&[CallState::Idle], "initiate")?;

        let offer = self.negotiated(self.negotiator.create_offer().await).await?;
        self.transition(CallState::Offering)?;
        self.deliver(Signal::CallOffer(offer)).await
    }

    /// Verarbeitet eine Verhandlungsnachricht der Gegenseite
    pub async fn handle_envelope(&self, envelope: Envelope) -> Result<(), CallError> {
        if envelope.from != self.remote_id || envelope.to != self.local_id {
            tracing::warn!(
                "Call {} rejects {} from {} to {}",
                self.id,
                envelope.signal.name(),
                envelope.from,
                envelope.to
            );
            return Err(CallError::PeerMismatch {
                actual: envelope.from,
            });
        }

        if let Signal::Hangup = envelope.signal {
            tracing::info!("Remote hangup on call {}", self.id);
            self.terminate(TerminationReason::RemoteHangup).await;
            return Ok(());
        }

        let _guard = self.op_lock.lock().await;
        if self.is_terminated() {
            tracing::debug!("Ignoring {} for terminated call", envelope.signal.name());
            return Err(CallError::Terminated);
        }

        match envelope.signal {
            Signal::CallOffer(offer) => self.on_call_offer(offer).await,
            Signal::CallAnswer(answer) => self.on_call_answer(answer).await,
            Signal::RenegotiationOffer(offer) => self.on_renegotiation_offer(offer).await,
            Signal::RenegotiationAnswer(answer) => self.on_renegotiation_answer(answer).await,
            Signal::Hangup => Ok(()),
        }
    }

    async fn on_call_offer(&self, offer: SessionDescription) -> Result<(), CallError> {
        match self.state() {
            CallState::Idle => {}
            CallState::Offering => {
                // Glare: die größere ID behält ihr Offer
                if self.local_id > self.remote_id {
                    tracing::info!("Offer glare on call {}: keeping own offer", self.id);
                    return Ok(());
                }
                tracing::info!("Offer glare on call {}: answering remote offer", self.id);
            }
            state if state.is_established() => return Err(CallError::AlreadyInCall),
            state => {
                return Err(CallError::InvalidState {
                    state,
                    action: "accept call offer",
                })
            }
        }

        self.transition(CallState::Answering)?;
        let answer = self
            .negotiated(self.negotiator.create_answer(&offer).await)
            .await?;
        self.deliver(Signal::CallAnswer(answer)).await?;
        self.transition(CallState::Connected)?;
        self.replay_renegotiation().await
    }

    async fn on_call_answer(&self, answer: SessionDescription) -> Result<(), CallError> {
        self.expect_state(&[CallState::Offering], "apply call answer")?;

        match self
            .negotiated(self.negotiator.apply_remote_answer(&answer).await)
            .await?
        {
            AnswerOutcome::Applied => {
                self.transition(CallState::Connected)?;
                self.replay_renegotiation().await
            }
            AnswerOutcome::Stale => Ok(()),
        }
    }

    async fn on_renegotiation_offer(&self, offer: SessionDescription) -> Result<(), CallError> {
        match self.state() {
            CallState::Connected => {}
            CallState::Negotiating => {
                // Die Gegenseite gibt ihr Offer auf und bietet es nach unserem Answer neu an
                if self.local_id > self.remote_id {
                    tracing::info!(
                        "Renegotiation glare on call {}: keeping own offer, peer re-offers",
                        self.id
                    );
                    return Ok(());
                }
                tracing::info!("Renegotiation glare on call {}: yielding", self.id);
                // Eigenes Offer ist aufgegeben, nach dem Answer erneut anbieten
                self.inner.lock().renegotiation_queued = true;
            }
            state => {
                return Err(CallError::InvalidState {
                    state,
                    action: "accept renegotiation offer",
                })
            }
        }

        let answer = self
            .negotiated(self.negotiator.create_answer(&offer).await)
            .await?;
        self.deliver(Signal::RenegotiationAnswer(answer)).await?;
        self.transition(CallState::Connected)?;
        self.replay_renegotiation().await
    }

    async fn on_renegotiation_answer(&self, answer: SessionDescription) -> Result<(), CallError> {
        self.expect_state(&[CallState::Negotiating], "apply renegotiation answer")?;

        match self
            .negotiated(self.negotiator.apply_remote_answer(&answer).await)
            .await?
        {
            AnswerOutcome::Applied => {
                self.transition(CallState::Connected)?;
                self.replay_renegotiation().await
            }
            AnswerOutcome::Stale => Ok(()),
        }
    }

    /// Reagiert auf eine geänderte lokale Track-Menge
    pub async fn on_renegotiation_needed(&self) -> Result<(), CallError> {
        let _guard = self.op_lock.lock().await;

        match self.state() {
            CallState::Connected => self.renegotiate().await,
            CallState::Offering | CallState::Answering | CallState::Negotiating => {
                tracing::debug!("Call {} queues renegotiation", self.id);
                self.inner.lock().renegotiation_queued = true;
                Ok(())
            }
            // Das erste Offer enthält ohnehin alle Tracks
            CallState::Idle | CallState::Terminated => Ok(()),
        }
    }

    /// Erwartet gehaltenen `op_lock`
    async fn renegotiate(&self) -> Result<(), CallError> {
        let offer = self.negotiated(self.negotiator.create_offer().await).await?;
        self.transition(CallState::Negotiating)?;
        self.deliver(Signal::RenegotiationOffer(offer)).await
    }

    /// Erwartet gehaltenen `op_lock`
    async fn replay_renegotiation(&self) -> Result<(), CallError> {
        let queued = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.renegotiation_queued)
        };
        if queued && self.state() == CallState::Connected {
            tracing::debug!("Call {} replays queued renegotiation", self.id);
            return self.renegotiate().await;
        }
        Ok(())
    }

    /// Verarbeitet ein Event der Transport-Session
    pub async fn handle_transport_event(&self, event: TransportEvent) -> Result<(), CallError> {
        match event {
            TransportEvent::NegotiationNeeded => self.on_renegotiation_needed().await,
            TransportEvent::RemoteTrack(track) => {
                let snapshot = {
                    let mut remote = self.remote_stream.lock();
                    remote.add_track(track).then(|| remote.clone())
                };
                if let Some(stream) = snapshot {
                    let _ = self.event_tx.send(CallEvent::RemoteStream(stream));
                }
                Ok(())
            }
            TransportEvent::Connected => {
                tracing::info!("Media transport of call {} connected", self.id);
                Ok(())
            }
            TransportEvent::ConnectionFailed(reason) => {
                self.terminate(TerminationReason::TransportFailed(reason)).await;
                Ok(())
            }
        }
    }

    /// Startet den Task, der Transport-Events in den Call leitet
    ///
    /// Endet mit dem Zustand `Terminated`.
    pub fn spawn_transport_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let call = Arc::clone(self);
        let mut events = self.negotiator.subscribe();
        let mut state_rx = self.watch_state();

        tokio::spawn(async move {
            while !call.is_terminated() {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => {
                            if let Err(e) = call.handle_transport_event(event).await {
                                tracing::warn!("Call {}: transport event failed: {}", call.id, e);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Call {} missed {} transport events", call.id, n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = state_rx.changed() => {
                        if changed.is_err() || state_rx.borrow().is_terminated() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Transport pump of call {} stopped", call.id);
        })
    }

    // ========================================================================
    // TERMINATION
    // ========================================================================

    /// Legt auf: Hangup senden (best effort) und beenden
    pub async fn end(&self) {
        if self.is_terminated() {
            return;
        }
        if let Err(e) = self
            .relay
            .send(Envelope::new(&self.local_id, &self.remote_id, Signal::Hangup))
        {
            tracing::debug!("Hangup for call {} not delivered: {}", self.id, e);
        }
        self.terminate(TerminationReason::LocalHangup).await;
    }

    /// Beendet den Anruf; gibt `false` zurück, wenn er schon beendet war
    ///
    /// Lokale Tracks werden sofort gestoppt, danach wird der Transport geschlossen.
    pub async fn terminate(&self, reason: TerminationReason) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_terminated() {
                return false;
            }
            inner.state = CallState::Terminated;
            inner.renegotiation_queued = false;
            inner.ended_at = Some(Utc::now());
        }

        tracing::info!("Call {} terminated: {}", self.id, reason);

        // Geräte freigeben (Drop stoppt alle Tracks)
        drop(self.local_stream.lock().take());

        self.state_tx.send_replace(CallState::Terminated);
        let _ = self
            .event_tx
            .send(CallEvent::StateChanged(CallState::Terminated));
        let _ = self.event_tx.send(CallEvent::Terminated { reason });

        if let Err(e) = self.negotiator.close().await {
            tracing::warn!("Failed to close transport of call {}: {}", self.id, e);
        }
        true
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    /// Wechselt den Zustand, außer der Anruf ist bereits beendet
    fn transition(&self, next: CallState) -> Result<(), CallError> {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_terminated() {
                return Err(CallError::Terminated);
            }
            if inner.state == next {
                return Ok(());
            }
            tracing::debug!("Call {}: {} -> {}", self.id, inner.state, next);
            inner.state = next;
            if next == CallState::Connected && inner.connected_at.is_none() {
                inner.connected_at = Some(Utc::now());
            }
        }

        self.state_tx.send_replace(next);
        let _ = self.event_tx.send(CallEvent::StateChanged(next));
        Ok(())
    }

    fn expect_state(&self, allowed: &[CallState], action: &'static str) -> Result<(), CallError> {
        let state = self.state();
        if state.is_terminated() {
            return Err(CallError::Terminated);
        }
        if !allowed.contains(&state) {
            return Err(CallError::InvalidState { state, action });
        }
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), CallError> {
        if self.is_terminated() {
            return Err(CallError::Terminated);
        }
        Ok(())
    }

    /// Ein Fehler der Transport-Session beendet den Anruf
    async fn negotiated<T>(&self, result: Result<T, NegotiationError>) -> Result<T, CallError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::warn!("Call {} negotiation failed: {}", self.id, e);
                self.terminate(TerminationReason::TransportFailed(e.to_string()))
                    .await;
                Err(e.into())
            }
        }
    }

    /// Sendet ein Signal; ist die Gegenseite weg, wird der Anruf beendet
    async fn deliver(&self, signal: Signal) -> Result<(), CallError> {
        let name = signal.name();
        match self
            .relay
            .send(Envelope::new(&self.local_id, &self.remote_id, signal))
        {
            Ok(()) => {
                tracing::debug!("Call {} sent {}", self.id, name);
                Ok(())
            }
            Err(e) => {
                let reason = match &e {
                    SignalingError::NotConnected => TerminationReason::SignalingLost,
                    _ => TerminationReason::DeliveryFailed,
                };
                tracing::warn!("Call {} could not send {}: {}", self.id, name, e);
                self.terminate(reason).await;
                Err(e.into())
            }
        }
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{CaptureRequest, MediaCapture, MediaKind, SyntheticCapture};
    use crate::negotiation::LoopbackTransport;
    use crate::signaling::{LocalLink, RelayHub, SignalingEvent, SignalingLink};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Relay, der gesendete Envelopes nur aufzeichnet
    #[derive(Default)]
    struct RecordingRelay {
        sent: Mutex<Vec<Envelope>>,
        fail: AtomicBool,
    }

    impl RecordingRelay {
        fn names(&self) -> Vec<&'static str> {
            self.sent.lock().iter().map(|e| e.signal.name()).collect()
        }

        fn last_description(&self) -> SessionDescription {
            match self.sent.lock().last().map(|e| e.signal.clone()) {
                Some(Signal::CallOffer(d))
                | Some(Signal::CallAnswer(d))
                | Some(Signal::RenegotiationOffer(d))
                | Some(Signal::RenegotiationAnswer(d)) => d,
                other => panic!("no description sent, last signal: {:?}", other),
            }
        }
    }

    impl Relay for RecordingRelay {
        fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SignalingError::DeliveryFailed { to: envelope.to });
            }
            self.sent.lock().push(envelope);
            Ok(())
        }
    }

    fn recorded_call(local: &str, remote: &str) -> (Call, Arc<RecordingRelay>) {
        let relay = Arc::new(RecordingRelay::default());
        let call = Call::new(
            local,
            remote,
            Arc::new(LoopbackTransport::new()),
            Arc::clone(&relay) as Arc<dyn Relay>,
        );
        (call, relay)
    }

    fn remote_negotiator() -> Negotiator {
        Negotiator::new(Arc::new(LoopbackTransport::new()))
    }

    async fn wait_for_state(call: &Call, state: CallState) {
        let mut rx = call.watch_state();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("call never reached {}", state))
            .unwrap();
    }

    async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "timed out: {}", what);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Leitet Envelopes eines Links in den Call
    fn spawn_router(link: &LocalLink, call: Arc<Call>) -> JoinHandle<()> {
        let mut events = link.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    SignalingEvent::Envelope(envelope) => {
                        let _ = call.handle_envelope(envelope).await;
                    }
                    SignalingEvent::PeerLeft { .. } => {
                        call.terminate(TerminationReason::PeerLeft).await;
                    }
                    _ => {}
                }
            }
        })
    }

    struct Side {
        link: Arc<LocalLink>,
        call: Arc<Call>,
        capture: SyntheticCapture,
    }

    async fn build_side(link: Arc<LocalLink>, remote: &str, request: &CaptureRequest) -> Side {
        let call = Arc::new(Call::new(
            &link.participant_id(),
            remote,
            Arc::new(LoopbackTransport::new()),
            Arc::clone(&link) as Arc<dyn Relay>,
        ));
        call.spawn_transport_pump();
        spawn_router(&link, Arc::clone(&call));

        let capture = SyntheticCapture::new();
        call.attach_local_stream(capture.acquire(request).unwrap())
            .await
            .unwrap();

        Side {
            link,
            call,
            capture,
        }
    }

    async fn connected_pair(request: CaptureRequest) -> (Arc<RelayHub>, Side, Side) {
        let hub = Arc::new(RelayHub::default());
        let link_a = Arc::new(LocalLink::connect(Arc::clone(&hub)));
        let link_b = Arc::new(LocalLink::connect(Arc::clone(&hub)));
        link_a.join_room("42").await.unwrap();
        link_b.join_room("42").await.unwrap();

        let a_id = link_a.participant_id();
        let a = build_side(link_a, &link_b.participant_id(), &request).await;
        let b = build_side(link_b, &a_id, &request).await;

        a.call.initiate().await.unwrap();
        wait_for_state(&a.call, CallState::Connected).await;
        wait_for_state(&b.call, CallState::Connected).await;

        (hub, a, b)
    }

    #[tokio::test]
    async fn test_initiate_sends_offer() {
        let (call, relay) = recorded_call("a", "b");
        let mut events = call.subscribe();

        call.initiate().await.unwrap();

        assert_eq!(call.state(), CallState::Offering);
        assert_eq!(relay.names(), vec!["call:offer"]);
        assert_eq!(
            events.try_recv().unwrap(),
            CallEvent::StateChanged(CallState::Offering)
        );

        assert!(matches!(
            call.initiate().await,
            Err(CallError::InvalidState {
                state: CallState::Offering,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_both_sides_reach_connected() {
        let (_hub, a, b) = connected_pair(CaptureRequest::audio_only()).await;

        assert!(a.call.connected_at().is_some());
        eventually("b receives a's audio", || b.call.remote_stream().len() == 1).await;
        eventually("a receives b's audio", || a.call.remote_stream().len() == 1).await;
        assert_eq!(b.call.remote_stream().count_of(MediaKind::Audio), 1);
    }

    #[tokio::test]
    async fn test_stale_answer_keeps_offering() {
        let (call, relay) = recorded_call("a", "b");
        call.initiate().await.unwrap();
        let offer = relay.last_description();

        let answer = SessionDescription::answer(
            remote_negotiator().create_answer(&offer).await.unwrap().sdp,
            offer.revision + 7,
        );
        call.handle_envelope(Envelope::new("b", "a", Signal::CallAnswer(answer)))
            .await
            .unwrap();

        assert_eq!(call.state(), CallState::Offering);
    }

    #[tokio::test]
    async fn test_envelope_from_stranger_is_rejected() {
        let (call, _) = recorded_call("a", "b");

        let result = call
            .handle_envelope(Envelope::new("mallory", "a", Signal::Hangup))
            .await;

        assert_eq!(
            result,
            Err(CallError::PeerMismatch {
                actual: "mallory".to_string()
            })
        );
        assert_eq!(call.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_incoming_offer_is_answered() {
        let (call, relay) = recorded_call("b", "a");
        let caller = remote_negotiator();
        let offer = caller.create_offer().await.unwrap();

        call.handle_envelope(Envelope::new("a", "b", Signal::CallOffer(offer.clone())))
            .await
            .unwrap();

        assert_eq!(call.state(), CallState::Connected);
        assert_eq!(relay.names(), vec!["call:answer"]);
        assert_eq!(relay.last_description().revision, offer.revision);

        // Zweites Offer während eines laufenden Anrufs
        let again = caller.create_offer().await.unwrap();
        assert_eq!(
            call.handle_envelope(Envelope::new("a", "b", Signal::CallOffer(again)))
                .await,
            Err(CallError::AlreadyInCall)
        );
        assert_eq!(call.state(), CallState::Connected);
    }

    #[tokio::test]
    async fn test_glare_greater_id_keeps_offer() {
        let (winner, winner_relay) = recorded_call("b", "a");
        let (loser, loser_relay) = recorded_call("a", "b");

        winner.initiate().await.unwrap();
        loser.initiate().await.unwrap();
        let winner_offer = winner_relay.last_description();
        let loser_offer = loser_relay.last_description();

        winner
            .handle_envelope(Envelope::new("a", "b", Signal::CallOffer(loser_offer)))
            .await
            .unwrap();
        loser
            .handle_envelope(Envelope::new("b", "a", Signal::CallOffer(winner_offer)))
            .await
            .unwrap();

        assert_eq!(winner.state(), CallState::Offering);
        assert_eq!(winner_relay.names(), vec!["call:offer"]);
        assert_eq!(loser.state(), CallState::Connected);
        assert_eq!(loser_relay.names(), vec!["call:offer", "call:answer"]);

        let answer = loser_relay.last_description();
        winner
            .handle_envelope(Envelope::new("a", "b", Signal::CallAnswer(answer)))
            .await
            .unwrap();
        assert_eq!(winner.state(), CallState::Connected);
    }

    #[tokio::test]
    async fn test_unusable_offer_terminates_and_releases_tracks() {
        let (call, relay) = recorded_call("b", "a");
        let capture = SyntheticCapture::new();
        call.attach_local_stream(capture.acquire(&CaptureRequest::default()).unwrap())
            .await
            .unwrap();
        assert_eq!(capture.active_tracks(), 2);

        let garbage = SessionDescription::offer("garbage".to_string(), 1);
        let result = call
            .handle_envelope(Envelope::new("a", "b", Signal::CallOffer(garbage)))
            .await;

        assert!(matches!(
            result,
            Err(CallError::Negotiation(NegotiationError::InvalidSdp(_)))
        ));
        assert_eq!(call.state(), CallState::Terminated);
        assert_eq!(capture.active_tracks(), 0);
        assert!(call.negotiator().is_closed());
        assert!(relay.names().is_empty());

        // Ein gültiges Offer danach trifft einen beendeten Anruf
        let offer = remote_negotiator().create_offer().await.unwrap();
        assert_eq!(
            call.handle_envelope(Envelope::new("a", "b", Signal::CallOffer(offer)))
                .await,
            Err(CallError::Terminated)
        );
    }

    #[tokio::test]
    async fn test_unusable_answer_terminates() {
        let (call, relay) = recorded_call("a", "b");
        let mut events = call.subscribe();
        call.initiate().await.unwrap();
        let offer = relay.last_description();

        let garbage = SessionDescription::answer("garbage".to_string(), offer.revision);
        let result = call
            .handle_envelope(Envelope::new("b", "a", Signal::CallAnswer(garbage)))
            .await;

        assert!(matches!(result, Err(CallError::Negotiation(_))));
        assert_eq!(call.state(), CallState::Terminated);

        let reason = loop {
            if let CallEvent::Terminated { reason } = events.try_recv().unwrap() {
                break reason;
            }
        };
        assert!(matches!(reason, TerminationReason::TransportFailed(_)));
    }

    /// Zwei verbundene Calls ohne Pumps; Envelopes werden von Hand zugestellt
    async fn manual_pair() -> ((Call, Arc<RecordingRelay>), (Call, Arc<RecordingRelay>)) {
        let (greater, greater_relay) = recorded_call("b", "a");
        let (lesser, lesser_relay) = recorded_call("a", "b");
        greater
            .add_local_tracks(vec![LocalTrack::new(MediaKind::Audio, "sb", "mic", || {})])
            .await
            .unwrap();
        lesser
            .add_local_tracks(vec![LocalTrack::new(MediaKind::Audio, "sa", "mic", || {})])
            .await
            .unwrap();

        lesser.initiate().await.unwrap();
        greater
            .handle_envelope(Envelope::new(
                "a",
                "b",
                Signal::CallOffer(lesser_relay.last_description()),
            ))
            .await
            .unwrap();
        lesser
            .handle_envelope(Envelope::new(
                "b",
                "a",
                Signal::CallAnswer(greater_relay.last_description()),
            ))
            .await
            .unwrap();
        assert_eq!(greater.state(), CallState::Connected);
        assert_eq!(lesser.state(), CallState::Connected);

        ((greater, greater_relay), (lesser, lesser_relay))
    }

    fn sent(relay: &RecordingRelay, from_end: usize) -> Envelope {
        let sent = relay.sent.lock();
        sent[sent.len() - 1 - from_end].clone()
    }

    fn remote_videos(events: &mut broadcast::Receiver<TransportEvent>) -> Vec<String> {
        let mut ids = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TransportEvent::RemoteTrack(track) = event {
                if track.kind == MediaKind::Video {
                    ids.push(track.id);
                }
            }
        }
        ids
    }

    #[tokio::test]
    async fn test_renegotiation_glare_converges() {
        let ((greater, greater_relay), (lesser, lesser_relay)) = manual_pair().await;
        let mut greater_events = greater.negotiator().subscribe();
        let mut lesser_events = lesser.negotiator().subscribe();

        let greater_video = LocalTrack::new(MediaKind::Video, "sb", "cam", || {});
        let lesser_video = LocalTrack::new(MediaKind::Video, "sa", "cam", || {});
        greater.add_local_tracks(vec![greater_video.clone()]).await.unwrap();
        lesser.add_local_tracks(vec![lesser_video.clone()]).await.unwrap();

        // Beide bieten gleichzeitig an
        greater.on_renegotiation_needed().await.unwrap();
        lesser.on_renegotiation_needed().await.unwrap();
        assert_eq!(greater.state(), CallState::Negotiating);
        assert_eq!(lesser.state(), CallState::Negotiating);

        greater.handle_envelope(sent(&lesser_relay, 0)).await.unwrap();
        assert_eq!(greater.state(), CallState::Negotiating);

        // Die kleinere ID antwortet und bietet ihr Offer erneut an
        lesser.handle_envelope(sent(&greater_relay, 0)).await.unwrap();
        assert_eq!(lesser.state(), CallState::Negotiating);
        let lesser_names = lesser_relay.names();
        assert_eq!(
            lesser_names[lesser_names.len() - 2..],
            ["renegotiation:answer", "renegotiation:offer"]
        );

        greater.handle_envelope(sent(&lesser_relay, 1)).await.unwrap();
        assert_eq!(greater.state(), CallState::Connected);

        greater.handle_envelope(sent(&lesser_relay, 0)).await.unwrap();
        assert_eq!(greater.state(), CallState::Connected);
        lesser.handle_envelope(sent(&greater_relay, 0)).await.unwrap();
        assert_eq!(lesser.state(), CallState::Connected);

        assert_eq!(remote_videos(&mut greater_events), vec![lesser_video.id().to_string()]);
        assert_eq!(remote_videos(&mut lesser_events), vec![greater_video.id().to_string()]);
    }

    #[tokio::test]
    async fn test_simultaneous_track_additions_converge() {
        let (_hub, a, b) = connected_pair(CaptureRequest::audio_only()).await;

        let video_a = a.capture.acquire_track(MediaKind::Video, "sa").unwrap();
        let video_b = b.capture.acquire_track(MediaKind::Video, "sb").unwrap();
        let (added_a, added_b) = tokio::join!(
            a.call.add_local_tracks(vec![video_a]),
            b.call.add_local_tracks(vec![video_b])
        );
        assert_eq!(added_a.unwrap(), 1);
        assert_eq!(added_b.unwrap(), 1);

        eventually("both sides receive video", || {
            a.call.remote_stream().count_of(MediaKind::Video) == 1
                && b.call.remote_stream().count_of(MediaKind::Video) == 1
        })
        .await;
        wait_for_state(&a.call, CallState::Connected).await;
        wait_for_state(&b.call, CallState::Connected).await;
    }

    #[tokio::test]
    async fn test_renegotiation_needed_is_queued_while_offering() {
        let (call, relay) = recorded_call("a", "b");

        // Im Idle-Zustand ignoriert
        call.on_renegotiation_needed().await.unwrap();
        assert_eq!(call.state(), CallState::Idle);
        assert!(relay.names().is_empty());

        call.initiate().await.unwrap();
        call.on_renegotiation_needed().await.unwrap();
        assert_eq!(call.state(), CallState::Offering);

        let offer = relay.last_description();
        let answer = remote_negotiator().create_answer(&offer).await.unwrap();
        call.handle_envelope(Envelope::new("b", "a", Signal::CallAnswer(answer)))
            .await
            .unwrap();

        assert_eq!(call.state(), CallState::Negotiating);
        assert_eq!(relay.names(), vec!["call:offer", "renegotiation:offer"]);
    }

    #[tokio::test]
    async fn test_renegotiation_delivers_new_track() {
        let (_hub, a, b) = connected_pair(CaptureRequest {
            audio: false,
            video: true,
        })
        .await;
        let stream_id = a.call.local_stream_id().unwrap();

        let second = a.capture.acquire_track(MediaKind::Video, &stream_id).unwrap();
        assert_eq!(a.call.add_local_tracks(vec![second]).await.unwrap(), 1);

        eventually("b receives the second video track", || {
            b.call.remote_stream().count_of(MediaKind::Video) == 2
        })
        .await;
        wait_for_state(&a.call, CallState::Connected).await;
        assert_eq!(b.call.state(), CallState::Connected);
        assert_eq!(b.call.remote_stream().len(), 2);
        assert_eq!(b.call.remote_stream().id(), Some(stream_id.as_str()));
    }

    #[tokio::test]
    async fn test_terminate_releases_tracks_and_is_absorbing() {
        let (call, _) = recorded_call("a", "b");
        let capture = SyntheticCapture::new();
        call.attach_local_stream(capture.acquire(&CaptureRequest::default()).unwrap())
            .await
            .unwrap();
        assert_eq!(capture.active_tracks(), 2);

        assert!(call.terminate(TerminationReason::LocalHangup).await);
        assert!(!call.terminate(TerminationReason::PeerLeft).await);

        assert_eq!(capture.active_tracks(), 0);
        assert!(call.negotiator().is_closed());
        assert_eq!(call.initiate().await, Err(CallError::Terminated));
        assert_eq!(*call.watch_state().borrow(), CallState::Terminated);

        // Später hinzugefügte Tracks werden sofort freigegeben
        let late = capture.acquire_track(MediaKind::Audio, "s").unwrap();
        assert!(call.add_local_tracks(vec![late]).await.is_err());
        assert_eq!(capture.active_tracks(), 0);
    }

    #[tokio::test]
    async fn test_delivery_failure_terminates() {
        let (call, relay) = recorded_call("a", "b");
        relay.fail.store(true, Ordering::SeqCst);
        let mut events = call.subscribe();

        let result = call.initiate().await;

        assert!(matches!(
            result,
            Err(CallError::Signaling(SignalingError::DeliveryFailed { .. }))
        ));
        assert_eq!(call.state(), CallState::Terminated);

        let mut reason = None;
        while let Ok(event) = events.try_recv() {
            if let CallEvent::Terminated { reason: r } = event {
                reason = Some(r);
            }
        }
        assert_eq!(reason, Some(TerminationReason::DeliveryFailed));
    }

    #[tokio::test]
    async fn test_remote_hangup_and_end() {
        let (_hub, a, b) = connected_pair(CaptureRequest::audio_only()).await;

        a.call.end().await;

        wait_for_state(&b.call, CallState::Terminated).await;
        assert_eq!(a.capture.active_tracks(), 0);
        assert_eq!(b.capture.active_tracks(), 0);
        assert!(a.call.duration().is_some());
        assert_eq!(b.link.hub().directory().occupants("42").len(), 2);
    }

    #[tokio::test]
    async fn test_transport_failure_terminates() {
        let relay = Arc::new(RecordingRelay::default());
        let transport = Arc::new(LoopbackTransport::new());
        let call = Arc::new(Call::new(
            "a",
            "b",
            Arc::clone(&transport) as Arc<dyn MediaTransport>,
            relay,
        ));
        let pump = call.spawn_transport_pump();

        transport.fail("ice failed");

        wait_for_state(&call, CallState::Terminated).await;
        tokio::time::timeout(Duration::from_secs(1), pump)
            .await
            .expect("pump did not stop")
            .unwrap();
    }
}
