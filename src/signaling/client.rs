//! WebSocket Client für den Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Relay-Server:
//! - Identität aus der `welcome` Nachricht
//! - Raumbeitritt mit Timeout
//! - Heartbeat-Keeping
//! - Event-basierte Kommunikation

use super::link::{SignalingEvent, SignalingLink};
use super::messages::{ClientMessage, Envelope, ServerMessage};
use super::relay::{Relay, SignalingError};
use crate::config::ClientConfig;
use crate::room::{ParticipantId, RoomId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

type JoinReply = Result<Vec<ParticipantId>, SignalingError>;

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    participant_id: Option<ParticipantId>,
    room_id: Option<RoomId>,
    last_pong: Option<DateTime<Utc>>,
}

/// Gemeinsamer Zustand von Client und Read-Task
struct Shared {
    state: RwLock<ClientState>,
    pending_join: Mutex<Option<oneshot::Sender<JoinReply>>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl Shared {
    fn resolve_join(&self, reply: JoinReply) -> bool {
        match self.pending_join.lock().take() {
            Some(tx) => {
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Relay-Kommunikation
pub struct SignalingClient {
    server_url: Url,
    shared: Arc<Shared>,
    tx: mpsc::Sender<Message>,
    join_timeout: Duration,
    heartbeat_interval: Duration,
}

impl SignalingClient {
    /// Verbindet mit dem Relay und wartet auf die vergebene Identität
    ///
    /// Der Heartbeat läuft ab hier, bis die Verbindung endet.
    pub async fn connect(config: &ClientConfig) -> Result<Self, SignalingError> {
        let server_url = config.signaling_url.clone();
        tracing::info!("Connecting to relay: {}", server_url);

        let (ws_stream, _) = connect_async(server_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        // Message-Sender erstellen
        let (tx, mut rx) = mpsc::channel::<Message>(config.event_capacity);
        let (event_tx, _) = broadcast::channel(config.event_capacity);

        let shared = Arc::new(Shared {
            state: RwLock::new(ClientState {
                is_connected: true,
                ..Default::default()
            }),
            pending_join: Mutex::new(None),
            event_tx,
        });

        // Channel für die Welcome-Nachricht
        let (welcome_tx, mut welcome_rx) = mpsc::channel::<ParticipantId>(1);

        // Read-Task starten
        let shared_clone = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => {
                            Self::handle_server_message(server_msg, &shared_clone, &welcome_tx)
                        }
                        Err(e) => tracing::warn!("Ignoring malformed relay message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            // Disconnect-Status setzen
            {
                let mut state = shared_clone.state.write();
                state.is_connected = false;
                state.room_id = None;
            }
            shared_clone.resolve_join(Err(SignalingError::NotConnected));
            let _ = shared_clone.event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task starten
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let client = Self {
            server_url,
            shared,
            tx,
            join_timeout: config.join_timeout,
            heartbeat_interval: config.heartbeat_interval,
        };

        // Auf Welcome warten (gleiches Limit wie beim Raumbeitritt)
        tokio::select! {
            result = welcome_rx.recv() => match result {
                Some(participant_id) => {
                    tracing::info!("Connected to relay as {}", participant_id);
                    client.start_heartbeat();
                    Ok(client)
                }
                None => Err(SignalingError::ConnectionFailed("connection closed before welcome".to_string())),
            },
            _ = tokio::time::sleep(client.join_timeout) => {
                Err(SignalingError::ConnectionFailed("Timeout waiting for welcome".to_string()))
            }
        }
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.shared.state.read().is_connected
    }

    /// Aktueller Raum (falls beigetreten)
    pub fn room_id(&self) -> Option<RoomId> {
        self.shared.state.read().room_id.clone()
    }

    /// Zeitpunkt der letzten Heartbeat-Antwort
    pub fn last_pong(&self) -> Option<DateTime<Utc>> {
        self.shared.state.read().last_pong
    }

    /// Schließt die Verbindung
    pub async fn disconnect(&self) -> Result<(), SignalingError> {
        self.tx
            .send(Message::Close(None))
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Sendet eine Nachricht synchron (non-blocking, verwendet try_send)
    fn send_message_sync(&self, msg: &ClientMessage) -> Result<(), SignalingError> {
        Self::send_via(&self.shared, &self.tx, msg)
    }

    fn send_via(
        shared: &Shared,
        tx: &mpsc::Sender<Message>,
        msg: &ClientMessage,
    ) -> Result<(), SignalingError> {
        if !shared.state.read().is_connected {
            return Err(SignalingError::NotConnected);
        }

        let msg_string =
            serde_json::to_string(msg).map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        // try_send ist non-blocking
        tx.try_send(Message::Text(msg_string))
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Verarbeitet eingehende Relay-Nachrichten
    fn handle_server_message(
        msg: ServerMessage,
        shared: &Shared,
        welcome_tx: &mpsc::Sender<ParticipantId>,
    ) {
        match &msg {
            ServerMessage::Welcome { participant_id } => {
                shared.state.write().participant_id = Some(participant_id.clone());
                let _ = welcome_tx.try_send(participant_id.clone());
            }

            ServerMessage::RoomJoined { room_id, peers } => {
                shared.state.write().room_id = Some(room_id.clone());
                shared.resolve_join(Ok(peers.clone()));
            }

            ServerMessage::RoomFull { room_id } => {
                shared.resolve_join(Err(SignalingError::RoomFull(room_id.clone())));
            }

            ServerMessage::Error { code, message } => {
                tracing::error!("Relay error {}: {}", code, message);
                // Bei Beitritts-Fehlern auch dem wartenden join_room melden
                shared.resolve_join(Err(SignalingError::Server {
                    code: *code,
                    message: message.clone(),
                }));
            }

            ServerMessage::Pong => {
                shared.state.write().last_pong = Some(Utc::now());
                return;
            }

            _ => {}
        }

        let local_id = shared.state.read().participant_id.clone().unwrap_or_default();
        if let Some(event) = SignalingEvent::from_server_message(&local_id, msg) {
            let _ = shared.event_tx.send(event);
        }
    }

    /// Startet den Heartbeat-Task; endet mit der Verbindung
    fn start_heartbeat(&self) {
        if self.heartbeat_interval.is_zero() {
            tracing::debug!("Heartbeat disabled");
            return;
        }

        let shared = Arc::clone(&self.shared);
        let tx = self.tx.clone();
        let mut interval = tokio::time::interval(self.heartbeat_interval);
        tokio::spawn(async move {
            // Der erste Tick kommt sofort
            interval.tick().await;
            loop {
                interval.tick().await;
                if !shared.state.read().is_connected {
                    break;
                }
                if let Err(e) = Self::send_via(&shared, &tx, &ClientMessage::Ping) {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
            tracing::debug!("Heartbeat stopped");
        });
    }
}

impl Relay for SignalingClient {
    fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        tracing::debug!("Sending {} to {}", envelope.signal.name(), envelope.to);
        self.send_message_sync(&ClientMessage::from_signal(envelope.to, envelope.signal))
    }
}

#[async_trait]
impl SignalingLink for SignalingClient {
    fn participant_id(&self) -> ParticipantId {
        self.shared
            .state
            .read()
            .participant_id
            .clone()
            .unwrap_or_default()
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.shared.event_tx.subscribe()
    }

    async fn join_room(&self, room_id: &str) -> Result<Vec<ParticipantId>, SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.shared.pending_join.lock().replace(reply_tx).is_some() {
            tracing::debug!("Replacing pending room join");
        }

        self.send_message_sync(&ClientMessage::RoomJoin {
            room_id: room_id.to_string(),
            participant_id: Some(self.participant_id()),
        })?;

        // Auf Bestätigung warten
        tokio::select! {
            result = reply_rx => match result {
                Ok(reply) => reply,
                Err(_) => Err(SignalingError::NotConnected),
            },
            _ = tokio::time::sleep(self.join_timeout) => {
                self.shared.pending_join.lock().take();
                Err(SignalingError::JoinTimeout)
            }
        }
    }

    async fn leave_room(&self) -> Result<(), SignalingError> {
        self.send_message_sync(&ClientMessage::RoomLeave)?;
        self.shared.state.write().room_id = None;
        Ok(())
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url.as_str())
            .field("state", &*self.shared.state.read())
            .finish()
    }
}
