//! Call Module - Orchestrierung und Peer Session
//!
//! Dieses Modul verwaltet:
//! - Die Anruf-Zustandsmaschine (eine Quelle der Wahrheit)
//! - Die WebRTC Peer Connection mit Candidate-Pufferung
//! - Den Dauer-Timer und das Klingel-Timeout

mod orchestrator;
mod peer;

pub use orchestrator::{
    CallDirection, CallError, CallEvent, CallInfo, CallKind, CallOrchestrator, CallPhase,
    EndReason, PendingInvitation, RemoteParty,
};
pub use peer::{PeerError, PeerEvent, PeerSession};
