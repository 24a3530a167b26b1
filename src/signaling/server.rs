//! WebSocket Relay-Server
//!
//! Bedient einen `RelayHub` über WebSocket: pro Verbindung ein Read-Loop und
//! ein Write-Task. Schließt ein Socket, verlässt der Teilnehmer seinen Raum.

use super::messages::{ClientMessage, ServerMessage, ERROR_PROTOCOL};
use super::relay::{RelayHub, SignalingError};
use crate::config::RelayConfig;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Relay-Server mit gebundenem Listener
pub struct RelayServer {
    hub: Arc<RelayHub>,
    listener: TcpListener,
}

impl RelayServer {
    /// Bindet den Listener an die konfigurierte Adresse
    pub async fn bind(config: &RelayConfig) -> Result<Self, SignalingError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            hub: Arc::new(RelayHub::new(config)),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SignalingError> {
        self.listener
            .local_addr()
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))
    }

    pub fn hub(&self) -> Arc<RelayHub> {
        Arc::clone(&self.hub)
    }

    /// Nimmt Verbindungen an, bis der Listener fehlschlägt
    pub async fn serve(self) -> Result<(), SignalingError> {
        loop {
            let (stream, addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

            let hub = Arc::clone(&self.hub);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(hub, stream, addr).await {
                    tracing::warn!("Connection {} ended with error: {}", addr, e);
                }
            });
        }
    }

    /// Wie `serve`, endet aber sobald `shutdown` fertig ist
    pub async fn serve_until<F>(self, shutdown: F) -> Result<(), SignalingError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.serve() => result,
            _ = shutdown => {
                tracing::info!("Relay shutting down");
                Ok(())
            }
        }
    }
}

/// Bedient eine einzelne WebSocket-Verbindung
async fn handle_connection(
    hub: Arc<RelayHub>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), SignalingError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;
    let (mut write, mut read) = ws_stream.split();

    let (participant_id, mut rx) = hub.connect();
    tracing::debug!("{} is participant {}", addr, participant_id);

    // Write-Task: Queue des Teilnehmers → Socket
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to encode relay message: {}", e);
                    continue;
                }
            };
            if let Err(e) = write.send(Message::Text(text)).await {
                tracing::debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
        let _ = write.close().await;
    });

    // Read-Loop: Socket → Hub
    let mut result = Ok(());
    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => hub.handle_client_message(&participant_id, msg),
                Err(e) => {
                    tracing::warn!("Malformed message from {}: {}", participant_id, e);
                    hub.notify(
                        &participant_id,
                        ServerMessage::error(ERROR_PROTOCOL, format!("malformed message: {}", e)),
                    );
                }
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                result = Err(SignalingError::ConnectionFailed(e.to_string()));
                break;
            }
            _ => {}
        }
    }

    // Raum verlassen, Queue schließen; der Write-Task endet danach
    hub.disconnect(&participant_id);
    let _ = writer.await;
    result
}

// ============================================================================
// TESTS
// ============================================================================
