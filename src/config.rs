//! Konfiguration für Client, Call-Orchestrierung und Relay
//!
//! Alle Werte haben Defaults; der Client wird explizit konstruiert
//! und bekommt seine Konfiguration injiziert.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// DEFAULTS
// ============================================================================

/// Keepalive-Intervall (Alive-Dokumente)
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Maximale Wartezeit auf das Self-Dokument beim Handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Basis-Verzögerung für Reconnect-Backoff
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Maximale Anzahl Reconnect-Versuche
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Klingeldauer, nach der ein unbeantworteter Anruf verfällt
pub const RING_TIMEOUT: Duration = Duration::from_secs(30);

/// Standard STUN-Server (für ~90% der Verbindungen ausreichend)
pub fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
        "stun:stun2.l.google.com:19302".to_string(),
    ]
}

// ============================================================================
// CLIENT CONFIG
// ============================================================================

/// Konfiguration des Signaling-Clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Basis-URL des Relays (http/https wird zu ws/wss umgeschrieben)
    pub server_url: String,

    /// User-Agent im Hello-Dokument
    pub user_agent: String,

    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    #[serde(with = "duration_millis")]
    pub reconnect_base_delay: Duration,

    pub reconnect_max_attempts: u32,

    /// Statische STUN-Liste; wird mit TURN aus dem Self-Dokument gemerged
    pub stun_servers: Vec<String>,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Default::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8443".to_string(),
            user_agent: format!("funkruf/{}", env!("CARGO_PKG_VERSION")),
            keepalive_interval: KEEPALIVE_INTERVAL,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            reconnect_base_delay: RECONNECT_BASE_DELAY,
            reconnect_max_attempts: RECONNECT_MAX_ATTEMPTS,
            stun_servers: default_stun_servers(),
        }
    }
}

// ============================================================================
// CALL CONFIG
// ============================================================================

/// Konfiguration des Call-Orchestrators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    #[serde(with = "duration_secs")]
    pub ring_timeout: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: RING_TIMEOUT,
        }
    }
}

// ============================================================================
// RELAY CONFIG
// ============================================================================

/// TURN-Ausgabe des Relays: statische Credentials mit TTL-Stempel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayTurnConfig {
    pub urls: Vec<String>,
    pub username: String,
    pub password: String,
    pub ttl_secs: u64,
}

/// Konfiguration des Rendezvous-Relays
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// STUN-Liste, die im Self-Dokument ausgegeben wird
    pub stun_servers: Vec<String>,

    /// Optionale TURN-Credentials für das Self-Dokument
    pub turn: Option<RelayTurnConfig>,

    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            turn: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

// ============================================================================
// SERDE HELPERS
// ============================================================================

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ============================================================================
// TESTS
// ============================================================================
