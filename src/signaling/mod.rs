//! Signaling Module - WebSocket-Client für das Rendezvous-Relay
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Relay:
//! - WebSocket-Verbindung aufbauen und halten
//! - Wire-Dokumente serialisieren und senden
//! - Eingehende Dokumente parsen und als Events verteilen
//!

mod client;
mod documents;

pub use client::{
    IceServerConfig, Session, SignalingClient, SignalingError, SignalingEvent, SignalingTransport,
    TurnCredentials, PROTOCOL_VERSION,
};
pub use documents::*;
