//! Konfiguration
//!
//! Relay und Client werden über Umgebungsvariablen konfiguriert. Fehlende
//! Werte fallen auf Defaults zurück, ungültige Werte sind ein Fehler.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

// ============================================================================
// CONSTANTS
// ============================================================================

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8000";
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),
}

fn invalid(key: &'static str, reason: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        reason: reason.to_string(),
    }
}

/// Liest eine Variable und parst sie, falls gesetzt
fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, e)),
        _ => Ok(None),
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

// ============================================================================
// ICE SERVERS
// ============================================================================

/// Zusätzlicher STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

// ============================================================================
// RELAY CONFIG
// ============================================================================

/// Konfiguration des Relay-Servers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    /// Größe der ausgehenden Queue pro Verbindung
    pub outbound_capacity: usize,
    /// Sender über nicht zustellbare Nachrichten informieren
    pub report_delivery_failures: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            outbound_capacity: DEFAULT_QUEUE_CAPACITY,
            report_delivery_failures: true,
        }
    }
}

impl RelayConfig {
    /// Liest die Konfiguration aus der Umgebung
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let outbound_capacity = parse_var(&lookup, "ROOMCALL_QUEUE_CAPACITY")?
            .unwrap_or(defaults.outbound_capacity);
        if outbound_capacity == 0 {
            return Err(invalid("ROOMCALL_QUEUE_CAPACITY", "must be greater than 0"));
        }

        Ok(Self {
            bind_addr: parse_var(&lookup, "ROOMCALL_BIND")?.unwrap_or(defaults.bind_addr),
            outbound_capacity,
            report_delivery_failures: parse_var(&lookup, "ROOMCALL_REPORT_DELIVERY_FAILURES")?
                .unwrap_or(defaults.report_delivery_failures),
        })
    }
}

// ============================================================================
// CLIENT CONFIG
// ============================================================================

/// Konfiguration eines Teilnehmers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub signaling_url: Url,
    pub event_capacity: usize,
    pub join_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Zusätzliche ICE Server (z.B. TURN), ergänzen die Standard-STUN-Server
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: Url::parse(DEFAULT_SIGNALING_URL)
                .unwrap_or_else(|_| unreachable!("default signaling url is valid")),
            event_capacity: DEFAULT_QUEUE_CAPACITY,
            join_timeout: Duration::from_millis(DEFAULT_JOIN_TIMEOUT_MS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            ice_servers: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Liest die Konfiguration aus der Umgebung
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let signaling_url = match lookup("SIGNALING_URL") {
            Some(raw) if !raw.trim().is_empty() => Self::parse_signaling_url(raw.trim())?,
            _ => defaults.signaling_url,
        };

        let join_timeout = parse_var::<u64, _>(&lookup, "ROOMCALL_JOIN_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.join_timeout);

        let heartbeat_secs: u64 = parse_var(&lookup, "ROOMCALL_HEARTBEAT_SECS")?
            .unwrap_or(DEFAULT_HEARTBEAT_SECS);
        if heartbeat_secs == 0 {
            return Err(invalid("ROOMCALL_HEARTBEAT_SECS", "must be greater than 0"));
        }

        // TURN nur, wenn eine URL gesetzt ist
        let ice_servers = match lookup("TURN_URL") {
            Some(url) if !url.trim().is_empty() => vec![IceServerConfig {
                urls: vec![url.trim().to_string()],
                username: lookup("TURN_USERNAME"),
                credential: lookup("TURN_CREDENTIAL"),
            }],
            _ => Vec::new(),
        };

        Ok(Self {
            signaling_url,
            event_capacity: defaults.event_capacity,
            join_timeout,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            ice_servers,
        })
    }

    /// Validiert die Signaling URL, `http(s)` wird zu `ws(s)`
    pub fn parse_signaling_url(raw: &str) -> Result<Url, ConfigError> {
        let mut url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(ConfigError::InvalidUrl(format!(
                    "unsupported scheme {}",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ConfigError::InvalidUrl(raw.to_string()))?;

        Ok(url)
    }
}

// ============================================================================
// TESTS
// ============================================================================
