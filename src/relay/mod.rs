//! Relay Module - Rendezvous-Server für Signaling-Dokumente
//!
//! Dieses Modul verwaltet:
//! - Die Endpoint-zu-Verbindung-Map (in-memory, last write wins)
//! - Das Weiterreichen adressierter Dokumente
//! - Den Push-Fallback für Offer an Offline-Endpoints

mod push;
mod server;

pub use push::{LogPushNotifier, PushNotifier};
pub use server::{Relay, RelayError};
