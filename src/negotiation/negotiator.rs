//! Session Description Negotiator
//!
//! Kapselt genau eine Transport-Session pro Anruf:
//! - Offers/Answers erzeugen und setzen
//! - Veraltete Answers verwerfen
//! - Tracks ohne Duplikate anhängen
//!
//! Alle Operationen, die eine Beschreibung erzeugen oder setzen, laufen
//! nacheinander (async Mutex), nie verschränkt.

use super::description::{SdpType, SessionDescription};
use super::transport::{MediaTransport, NegotiationError, TransportEvent};
use crate::media::LocalTrack;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Ergebnis von `apply_remote_answer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Applied,
    /// Answer gehörte nicht zum letzten Offer und wurde verworfen
    Stale,
}

#[derive(Debug, Default)]
struct NegotiatorState {
    next_revision: u64,
    pending_offer: Option<u64>,
    attached: HashSet<String>,
    closed: bool,
}

/// Negotiator für eine Transport-Session
pub struct Negotiator {
    transport: Arc<dyn MediaTransport>,
    state: Mutex<NegotiatorState>,
    op_lock: tokio::sync::Mutex<()>,
}

impl Negotiator {
    pub fn new(transport: Arc<dyn MediaTransport>) -> Self {
        Self {
            transport,
            state: Mutex::new(NegotiatorState {
                next_revision: 1,
                ..Default::default()
            }),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Gibt einen Event-Receiver der Transport-Session zurück
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.transport.subscribe()
    }

    /// Revision des ausstehenden Offers, falls vorhanden
    pub fn pending_offer(&self) -> Option<u64> {
        self.state.lock().pending_offer
    }

    pub fn attached_track_count(&self) -> usize {
        self.state.lock().attached.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Erzeugt ein neues Offer und setzt es als lokale Beschreibung
    ///
    /// Ein noch offenes älteres Offer wird dadurch abgelöst.
    pub async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_open()?;

        let sdp = self.transport.create_offer().await?;
        let revision = {
            let mut state = self.state.lock();
            let revision = state.next_revision;
            state.next_revision += 1;
            revision
        };

        let mut offer = SessionDescription::offer(sdp, revision);
        offer.sdp = self.transport.set_local_description(&offer).await?;

        let superseded = self.state.lock().pending_offer.replace(revision);
        if let Some(old) = superseded {
            tracing::debug!("Offer {} superseded by offer {}", old, revision);
        }

        tracing::debug!("Created offer {}", revision);
        Ok(offer)
    }

    /// Setzt ein entferntes Offer und erzeugt das passende Answer
    ///
    /// Ein eigenes offenes Offer wird dabei aufgegeben.
    pub async fn create_answer(
        &self,
        remote_offer: &SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        if remote_offer.sdp_type != SdpType::Offer {
            return Err(NegotiationError::UnexpectedType {
                expected: "offer",
                actual: remote_offer.sdp_type.to_string(),
            });
        }

        let _guard = self.op_lock.lock().await;
        self.ensure_open()?;

        self.transport.set_remote_description(remote_offer).await?;
        if let Some(abandoned) = self.state.lock().pending_offer.take() {
            tracing::debug!("Offer {} abandoned for remote offer", abandoned);
        }
        let sdp = self.transport.create_answer().await?;

        let mut answer = SessionDescription::answer(sdp, remote_offer.revision);
        answer.sdp = self.transport.set_local_description(&answer).await?;

        tracing::debug!("Answered remote offer {}", remote_offer.revision);
        Ok(answer)
    }

    /// Setzt ein entferntes Answer, aber nur wenn es zum letzten Offer passt
    pub async fn apply_remote_answer(
        &self,
        answer: &SessionDescription,
    ) -> Result<AnswerOutcome, NegotiationError> {
        if answer.sdp_type != SdpType::Answer {
            return Err(NegotiationError::UnexpectedType {
                expected: "answer",
                actual: answer.sdp_type.to_string(),
            });
        }

        let _guard = self.op_lock.lock().await;
        self.ensure_open()?;

        let pending = self.state.lock().pending_offer;
        if pending != Some(answer.revision) {
            tracing::warn!(
                "Discarding stale answer for offer {} (pending: {:?})",
                answer.revision,
                pending
            );
            return Ok(AnswerOutcome::Stale);
        }

        self.transport.set_remote_description(answer).await?;
        self.state.lock().pending_offer = None;

        tracing::debug!("Applied answer for offer {}", answer.revision);
        Ok(AnswerOutcome::Applied)
    }

    /// Hängt Tracks an, deren ID noch nicht angehängt ist
    ///
    /// Gibt die Anzahl neu angehängter Tracks zurück. Eine nötige
    /// Neuverhandlung meldet die Transport-Session selbst.
    pub async fn attach_tracks(&self, tracks: &[LocalTrack]) -> Result<usize, NegotiationError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_open()?;

        let mut added = 0;
        for track in tracks {
            if self.state.lock().attached.contains(track.id()) {
                tracing::debug!("Track {} already attached, skipping", track.id());
                continue;
            }

            self.transport.add_track(track).await?;
            self.state.lock().attached.insert(track.id().to_string());
            added += 1;
        }

        Ok(added)
    }

    /// Schließt die Transport-Session; spätere Operationen schlagen fehl
    ///
    /// Wartet nicht auf laufende Operationen.
    pub async fn close(&self) -> Result<(), NegotiationError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.pending_offer = None;
        }
        self.transport.close().await
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.state.lock().closed {
            return Err(NegotiationError::Closed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("state", &*self.state.lock())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaKind, RemoteTrack};
    use crate::negotiation::LoopbackTransport;

    fn negotiator() -> (Negotiator, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::new());
        (Negotiator::new(transport.clone()), transport)
    }

    #[tokio::test]
    async fn test_stale_answer_is_discarded() {
        let (caller, _) = negotiator();
        let (callee, _) = negotiator();

        let offer1 = caller.create_offer().await.unwrap();
        let offer2 = caller.create_offer().await.unwrap();
        let answer1 = callee.create_answer(&offer1).await.unwrap();

        let outcome = caller.apply_remote_answer(&answer1).await.unwrap();

        assert_eq!(outcome, AnswerOutcome::Stale);
        assert_eq!(caller.pending_offer(), Some(offer2.revision));
    }

    #[tokio::test]
    async fn test_matching_answer_clears_pending_offer() {
        let (caller, _) = negotiator();
        let (callee, _) = negotiator();

        let offer = caller.create_offer().await.unwrap();
        let answer = callee.create_answer(&offer).await.unwrap();
        assert_eq!(answer.revision, offer.revision);

        let outcome = caller.apply_remote_answer(&answer).await.unwrap();
        assert_eq!(outcome, AnswerOutcome::Applied);
        assert_eq!(caller.pending_offer(), None);

        // Ein zweites Mal ist es veraltet
        let again = caller.apply_remote_answer(&answer).await.unwrap();
        assert_eq!(again, AnswerOutcome::Stale);
    }

    #[tokio::test]
    async fn test_answering_abandons_own_offer() {
        let (a, _) = negotiator();
        let (b, _) = negotiator();

        a.create_offer().await.unwrap();
        let offer_b = b.create_offer().await.unwrap();
        a.create_answer(&offer_b).await.unwrap();

        assert_eq!(a.pending_offer(), None);
    }

    #[tokio::test]
    async fn test_attach_same_track_twice() {
        let (negotiator, transport) = negotiator();
        let track = LocalTrack::new(MediaKind::Video, "s1", "cam", || {});

        assert_eq!(negotiator.attach_tracks(&[track.clone()]).await.unwrap(), 1);
        assert_eq!(negotiator.attach_tracks(&[track.clone(), track]).await.unwrap(), 0);

        assert_eq!(negotiator.attached_track_count(), 1);
        assert_eq!(transport.local_track_count(), 1);
    }

    #[tokio::test]
    async fn test_wrong_description_types_are_rejected() {
        let (negotiator, _) = negotiator();
        let answer = SessionDescription::answer("v=0".to_string(), 1);
        let offer = SessionDescription::offer("v=0".to_string(), 1);

        assert!(matches!(
            negotiator.create_answer(&answer).await,
            Err(NegotiationError::UnexpectedType { .. })
        ));
        assert!(matches!(
            negotiator.apply_remote_answer(&offer).await,
            Err(NegotiationError::UnexpectedType { .. })
        ));
    }

    #[tokio::test]
    async fn test_remote_tracks_surface_on_answer() {
        let (caller, _) = negotiator();
        let (callee, _) = negotiator();
        let mut events = callee.subscribe();

        let track = LocalTrack::new(MediaKind::Audio, "s1", "mic", || {});
        caller.attach_tracks(&[track.clone()]).await.unwrap();

        let offer = caller.create_offer().await.unwrap();
        callee.create_answer(&offer).await.unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            TransportEvent::RemoteTrack(RemoteTrack {
                id: track.id().to_string(),
                kind: MediaKind::Audio,
                stream_id: Some("s1".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn test_closed_negotiator_refuses_work() {
        let (negotiator, transport) = negotiator();
        negotiator.close().await.unwrap();

        assert!(transport.is_closed());
        assert_eq!(
            negotiator.create_offer().await.unwrap_err(),
            NegotiationError::Closed
        );
    }
}
