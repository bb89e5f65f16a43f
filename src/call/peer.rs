//! Peer Session - WebRTC-Verbindung eines Anrufs
//!
//! Besitzt die eine Peer Connection pro Anruf, hängt die lokalen
//! Tracks an und puffert ICE Candidates, die vor der Remote
//! Description eintreffen. Die Queue wird genau einmal geleert,
//! unmittelbar nachdem die Remote Description gesetzt wurde.

use crate::media::LocalMedia;
use crate::signaling::{CandidateInit, IceServerConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("No active peer connection")]
    NoConnection,

    #[error("Peer session already torn down")]
    TornDown,
}

// ============================================================================
// PEER EVENTS
// ============================================================================

/// Events der Peer Connection
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Verbindungszustand hat sich geändert
    ConnectionState(RTCPeerConnectionState),

    /// Lokal gesammelter ICE Candidate (an die Gegenseite zu senden)
    LocalCandidate(CandidateInit),

    /// Remote-Track empfangen
    RemoteTrack { mime_type: String },
}

// ============================================================================
// CANDIDATE GATE
// ============================================================================

/// Queue und Beschreibungs-Flag unter einem Lock, damit kein Candidate
/// zwischen Flush und Direktanwendung verloren geht
#[derive(Debug, Default)]
struct CandidateGate {
    has_remote_description: bool,
    queue: Vec<CandidateInit>,
}

// ============================================================================
// PEER SESSION
// ============================================================================

/// Die eine WebRTC-Verbindung eines Anrufs
///
/// Entsteht beim Übergang nach Connecting und wird bei jeder Rückkehr
/// nach Idle abgebaut.
pub struct PeerSession {
    media: LocalMedia,
    ice_servers: Vec<RTCIceServer>,
    pc: Mutex<Option<Arc<RTCPeerConnection>>>,
    gate: Mutex<CandidateGate>,
    event_tx: broadcast::Sender<PeerEvent>,
    torn_down: AtomicBool,
}

impl PeerSession {
    pub fn new(ice_servers: Vec<IceServerConfig>, media: LocalMedia) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            media,
            ice_servers: to_rtc_ice_servers(&ice_servers),
            pc: Mutex::new(None),
            gate: Mutex::new(CandidateGate::default()),
            event_tx,
            torn_down: AtomicBool::new(false),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.event_tx.subscribe()
    }

    /// Lokale Medien des Anrufs
    pub fn media(&self) -> &LocalMedia {
        &self.media
    }

    /// Aktueller Verbindungszustand, falls eine Verbindung existiert
    pub fn connection_state(&self) -> Option<RTCPeerConnectionState> {
        self.pc.lock().as_ref().map(|pc| pc.connection_state())
    }

    /// Anzahl gepufferter Candidates (vor der Remote Description)
    pub fn pending_candidates(&self) -> usize {
        self.gate.lock().queue.len()
    }

    // ========================================================================
    // NEGOTIATION
    // ========================================================================

    /// Erstellt das lokale Offer
    ///
    /// Legt die Peer Connection bei Bedarf an und hängt die lokalen
    /// Tracks an.
    pub async fn create_offer(&self) -> Result<String, PeerError> {
        let pc = self.ensure_connection().await?;

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        Ok(offer.sdp)
    }

    /// Wendet das Remote Offer an und erstellt das Answer
    ///
    /// Gepufferte Candidates werden direkt nach der Remote Description
    /// angewendet.
    pub async fn apply_remote_offer(&self, sdp: String) -> Result<String, PeerError> {
        let pc = self.ensure_connection().await?;

        let offer =
            RTCSessionDescription::offer(sdp).map_err(|e| PeerError::InvalidSdp(e.to_string()))?;

        pc.set_remote_description(offer)
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        self.flush_candidates(&pc).await;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        Ok(answer.sdp)
    }

    /// Wendet das Remote Answer auf die bestehende Verbindung an
    pub async fn apply_remote_answer(&self, sdp: String) -> Result<(), PeerError> {
        let pc = self.pc.lock().clone().ok_or(PeerError::NoConnection)?;

        let answer =
            RTCSessionDescription::answer(sdp).map_err(|e| PeerError::InvalidSdp(e.to_string()))?;

        pc.set_remote_description(answer)
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        self.flush_candidates(&pc).await;
        Ok(())
    }

    /// Nimmt einen Remote Candidate entgegen
    ///
    /// Vor der Remote Description wird gepuffert, danach direkt
    /// angewendet. Fehlerhafte Candidates werden geloggt und verworfen.
    pub async fn add_remote_candidate(&self, candidate: CandidateInit) {
        let pc = {
            let mut gate = self.gate.lock();
            if !gate.has_remote_description {
                tracing::debug!("Queueing remote candidate (no remote description yet)");
                gate.queue.push(candidate);
                return;
            }
            self.pc.lock().clone()
        };

        if let Some(pc) = pc {
            if let Err(e) = Self::apply_candidate(&pc, candidate).await {
                tracing::warn!("Dropping unusable remote candidate: {}", e);
            }
        }
    }

    /// Leert die Candidate-Queue genau einmal, in Ankunftsreihenfolge
    async fn flush_candidates(&self, pc: &Arc<RTCPeerConnection>) {
        let queued: Vec<CandidateInit> = {
            let mut gate = self.gate.lock();
            gate.has_remote_description = true;
            std::mem::take(&mut gate.queue)
        };

        if queued.is_empty() {
            return;
        }

        tracing::info!("Applying {} queued candidates", queued.len());
        for candidate in queued {
            if let Err(e) = Self::apply_candidate(pc, candidate).await {
                tracing::warn!("Dropping unusable queued candidate: {}", e);
            }
        }
    }

    async fn apply_candidate(
        pc: &Arc<RTCPeerConnection>,
        candidate: CandidateInit,
    ) -> Result<(), PeerError> {
        pc.add_ice_candidate(RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        })
        .await
        .map_err(|e| PeerError::WebRtc(e.to_string()))
    }

    // ========================================================================
    // TOGGLES
    // ========================================================================

    /// Schaltet das Mikrofon stumm bzw. wieder ein
    pub fn toggle_mute(&self) -> bool {
        self.media.toggle_mute()
    }

    /// Schaltet den Video-Track ein bzw. aus
    pub fn toggle_video(&self) -> bool {
        self.media.toggle_video()
    }

    /// Wechselt die Audio-Ausgabe-Route
    pub fn toggle_speaker(&self) -> crate::media::SpeakerRoute {
        self.media.toggle_speaker()
    }

    /// Wechselt die Kamera
    pub fn switch_camera(&self) -> crate::media::CameraFacing {
        self.media.switch_camera()
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Baut die Session ab: Tracks stoppen, Verbindung schließen,
    /// Puffer leeren
    ///
    /// Idempotent und aus jedem Zustand sicher aufrufbar.
    pub async fn teardown(&self) {
        let pc = self.pc.lock().take();
        if let Some(pc) = pc {
            if let Err(e) = pc.close().await {
                tracing::warn!("Error closing peer connection: {}", e);
            }
        }

        self.media.stop();

        {
            let mut gate = self.gate.lock();
            gate.queue.clear();
            gate.has_remote_description = false;
        }

        if !self.torn_down.swap(true, Ordering::SeqCst) {
            tracing::debug!("Peer session torn down");
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Liefert die Peer Connection, erstellt sie beim ersten Zugriff
    async fn ensure_connection(&self) -> Result<Arc<RTCPeerConnection>, PeerError> {
        if let Some(pc) = self.pc.lock().clone() {
            return Ok(pc);
        }
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(PeerError::TornDown);
        }

        // Media Engine mit Standard-Codecs
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| PeerError::WebRtc(e.to_string()))?,
        );

        // Lokale Tracks anhängen
        for track in self.media.tracks() {
            pc.add_track(track)
                .await
                .map_err(|e| PeerError::WebRtc(e.to_string()))?;
        }

        self.register_handlers(&pc);

        *self.pc.lock() = Some(Arc::clone(&pc));
        Ok(pc)
    }

    /// Registriert Event Handler für die Peer Connection
    fn register_handlers(&self, pc: &Arc<RTCPeerConnection>) {
        // Connection State Handler
        let event_tx = self.event_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", state);
            let _ = event_tx.send(PeerEvent::ConnectionState(state));
            Box::pin(async {})
        }));

        // ICE Candidate Handler
        let event_tx = self.event_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                if let Ok(json) = c.to_json() {
                    let _ = event_tx.send(PeerEvent::LocalCandidate(CandidateInit {
                        sdp_mline_index: json.sdp_mline_index,
                        sdp_mid: json.sdp_mid,
                        candidate: json.candidate,
                    }));
                }
            }
            Box::pin(async {})
        }));

        // Track Handler (eingehende Medien)
        let event_tx = self.event_tx.clone();
        pc.on_track(Box::new(move |track, _, _| {
            let mime_type = track.codec().capability.mime_type.clone();
            tracing::info!("Received remote track: {}", mime_type);
            let _ = event_tx.send(PeerEvent::RemoteTrack { mime_type });
            Box::pin(async move {})
        }));
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("connection_state", &self.connection_state())
            .field("pending_candidates", &self.pending_candidates())
            .field("is_torn_down", &self.is_torn_down())
            .finish()
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn to_rtc_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaConstraints, MediaSource, StaticMediaSource};

    async fn session(wants_video: bool) -> PeerSession {
        let media = StaticMediaSource
            .acquire(&MediaConstraints::for_call(wants_video))
            .await
            .unwrap();
        PeerSession::new(vec![], media)
    }

    fn candidate(n: u16) -> CandidateInit {
        CandidateInit {
            sdp_mline_index: Some(0),
            sdp_mid: Some("0".to_string()),
            candidate: format!("candidate:{n} 1 udp 2130706431 127.0.0.1 {} typ host", 50000 + n),
        }
    }

    #[tokio::test]
    async fn test_offer_contains_audio_section() {
        let peer = session(false).await;
        let sdp = peer.create_offer().await.unwrap();
        assert!(sdp.contains("m=audio"));
        assert!(!sdp.contains("m=video"));
    }

    #[tokio::test]
    async fn test_video_offer_contains_video_section() {
        let peer = session(true).await;
        let sdp = peer.create_offer().await.unwrap();
        assert!(sdp.contains("m=audio"));
        assert!(sdp.contains("m=video"));
    }

    #[tokio::test]
    async fn test_candidates_queue_before_remote_description() {
        let caller = session(false).await;
        let callee = session(false).await;

        // Candidates treffen vor dem Offer ein
        callee.add_remote_candidate(candidate(1)).await;
        callee.add_remote_candidate(candidate(2)).await;
        callee.add_remote_candidate(candidate(3)).await;
        assert_eq!(callee.pending_candidates(), 3);

        // Reihenfolge in der Queue entspricht der Ankunft
        {
            let gate = callee.gate.lock();
            assert!(gate.queue[0].candidate.starts_with("candidate:1"));
            assert!(gate.queue[1].candidate.starts_with("candidate:2"));
            assert!(gate.queue[2].candidate.starts_with("candidate:3"));
        }

        // Remote Description leert die Queue genau einmal
        let offer = caller.create_offer().await.unwrap();
        let answer = callee.apply_remote_offer(offer).await.unwrap();
        assert!(answer.contains("m=audio"));
        assert_eq!(callee.pending_candidates(), 0);

        // Nachzügler werden direkt angewendet, nicht erneut gepuffert
        callee.add_remote_candidate(candidate(4)).await;
        assert_eq!(callee.pending_candidates(), 0);
    }

    #[tokio::test]
    async fn test_offer_answer_roundtrip() {
        let caller = session(false).await;
        let callee = session(false).await;

        let offer = caller.create_offer().await.unwrap();
        let answer = callee.apply_remote_offer(offer).await.unwrap();
        caller.apply_remote_answer(answer).await.unwrap();
    }

    #[tokio::test]
    async fn test_apply_answer_without_connection_fails() {
        let peer = session(false).await;
        let result = peer.apply_remote_answer("v=0".to_string()).await;
        assert!(matches!(result, Err(PeerError::NoConnection)));
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let peer = session(false).await;
        peer.create_offer().await.unwrap();
        peer.add_remote_candidate(candidate(1)).await;

        peer.teardown().await;
        assert!(peer.is_torn_down());
        assert!(peer.connection_state().is_none());
        assert_eq!(peer.pending_candidates(), 0);
        assert!(peer.media().is_stopped());

        // Zweiter Aufruf ist unschädlich
        peer.teardown().await;
        assert!(peer.connection_state().is_none());
    }

    #[tokio::test]
    async fn test_no_new_connection_after_teardown() {
        let peer = session(false).await;
        peer.teardown().await;

        let result = peer.create_offer().await;
        assert!(matches!(result, Err(PeerError::TornDown)));
    }

    #[tokio::test]
    async fn test_toggles_without_renegotiation() {
        let peer = session(true).await;
        peer.create_offer().await.unwrap();

        assert!(peer.toggle_mute());
        assert!(!peer.toggle_video());
        // Die Verbindung bleibt unberührt
        assert!(peer.connection_state().is_some());
    }
}
