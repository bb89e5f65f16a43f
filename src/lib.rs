//! Funkruf - P2P Audio/Video-Anruf-Engine
//!
//! Zwei registrierte Endpoints bauen über ein kleines Rendezvous-Relay
//! eine direkte Audio/Video-Verbindung auf:
//! - Signaling-Client mit Hello/Self-Handshake, Keepalive und Reconnect
//! - Call-Orchestrator als einzige Anruf-Zustandsmaschine
//! - Peer Session mit Candidate-Pufferung
//! - Relay mit Push-Fallback für Offline-Endpoints

pub mod call;
pub mod config;
pub mod media;
pub mod relay;
pub mod signaling;

pub use call::{CallEvent, CallKind, CallOrchestrator, CallPhase};
pub use config::{CallConfig, ClientConfig, RelayConfig};
pub use media::{MediaSource, StaticMediaSource};
pub use relay::{LogPushNotifier, PushNotifier, Relay};
pub use signaling::{Session, SignalingClient, SignalingEvent, SignalingTransport};
