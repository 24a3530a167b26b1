//! Relay-Server: Rendezvous und Signaling für RoomCall
//!
//! Konfiguration über Umgebungsvariablen (siehe `RelayConfig::from_env`).

use anyhow::Context;
use roomcall_lib::signaling::RelayServer;
use roomcall_lib::RelayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    roomcall_lib::init_logging().context("failed to initialize logging")?;

    let config = RelayConfig::from_env().context("invalid relay configuration")?;
    let server = RelayServer::bind(&config)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("Relay listening on {}", server.local_addr()?);

    server
        .serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down relay");
        })
        .await?;

    Ok(())
}
