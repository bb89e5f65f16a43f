//! Call Orchestrator - die eine Zustandsmaschine des Anrufs
//!
//! Einzige Quelle der Wahrheit für die Anruf-Phase. Reagiert auf
//! lokale Intents (start, accept, reject, end) und auf eingehende
//! Signaling-Events (Offer, Answer, Candidate, Bye) und koordiniert
//! Peer Session und Signaling-Client. Besitzt den Dauer-Timer.

use super::peer::{PeerError, PeerEvent, PeerSession};
use crate::config::CallConfig;
use crate::media::{MediaConstraints, MediaError, MediaSource};
use crate::signaling::{
    sdp_wants_video, ByeReason, CandidateInit, SignalingError, SignalingEvent, SignalingTransport,
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No incoming call to answer")]
    NotRinging,

    #[error("No active call")]
    NoActiveCall,

    #[error("Call was cancelled")]
    Cancelled,

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] PeerError),
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Phase des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    OutgoingRinging,
    IncomingRinging,
    Connecting,
    Active,
    Ended,
}

/// Richtung des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Art des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Audio,
    Video,
}

/// Beschreibung der Gegenseite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteParty {
    pub id: String,
    pub name: String,
}

/// Unbeantwortetes Offer während IncomingRinging
#[derive(Debug, Clone)]
pub struct PendingInvitation {
    pub caller: RemoteParty,
    pub kind: CallKind,
    pub offer_sdp: String,
    pub room: Option<String>,
}

/// Grund für das Ende eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Lokal aufgelegt oder abgelehnt
    Hangup,
    /// Gegenseite hat aufgelegt
    RemoteHangup,
    /// Gegenseite ist besetzt
    RemoteBusy,
    /// Gegenseite hat abgelehnt
    RemoteRejected,
    /// Anruf wurde nicht angenommen
    PickupTimeout,
    /// Abbruch durch Fehler
    Aborted,
    /// Verbindung verloren
    ConnectionLost,
}

impl EndReason {
    fn from_bye(reason: Option<ByeReason>) -> Self {
        match reason {
            None => EndReason::RemoteHangup,
            Some(ByeReason::Busy) => EndReason::RemoteBusy,
            Some(ByeReason::Reject) => EndReason::RemoteRejected,
            Some(ByeReason::Pickuptimeout) => EndReason::PickupTimeout,
            Some(ByeReason::Abort) => EndReason::Aborted,
        }
    }

    /// Kurze nutzerseitige Meldung
    pub fn user_message(&self) -> &'static str {
        match self {
            EndReason::Hangup => "Call ended",
            EndReason::RemoteHangup => "The other party hung up",
            EndReason::RemoteBusy => "The other party is busy",
            EndReason::RemoteRejected => "Call was rejected",
            EndReason::PickupTimeout => "Call was not answered",
            EndReason::Aborted => "Call was aborted",
            EndReason::ConnectionLost => "Connection lost",
        }
    }
}

/// Schnappschuss des Anruf-Zustands für die UI
#[derive(Debug, Clone)]
pub struct CallInfo {
    pub phase: CallPhase,
    pub direction: Option<CallDirection>,
    pub kind: Option<CallKind>,
    pub remote: Option<RemoteParty>,
    pub room: Option<String>,
    pub duration_secs: u64,
}

/// Events des Orchestrators an die UI
#[derive(Debug, Clone)]
pub enum CallEvent {
    PhaseChanged(CallPhase),
    Ring { caller: RemoteParty, kind: CallKind },
    Tick { seconds: u64 },
    Ended { reason: EndReason },
    Error { message: String },
}

// ============================================================================
// INNER STATE
// ============================================================================

struct CallInner {
    phase: CallPhase,
    /// Wird bei jedem Anruf-Start und jeder Rückkehr nach Idle erhöht;
    /// verspätete Async-Ergebnisse mit alter Generation sind inert
    generation: u64,
    direction: Option<CallDirection>,
    kind: Option<CallKind>,
    remote: Option<RemoteParty>,
    room: Option<String>,
    duration_secs: u64,
    pending: Option<PendingInvitation>,
    /// Candidates, die eintreffen bevor die Peer Session existiert
    /// (zwischen Offer und Accept); werden beim Setup nachgereicht
    early_candidates: Vec<CandidateInit>,
    duration_timer: Option<JoinHandle<()>>,
    ring_timer: Option<JoinHandle<()>>,
}

impl CallInner {
    fn new() -> Self {
        Self {
            phase: CallPhase::Idle,
            generation: 0,
            direction: None,
            kind: None,
            remote: None,
            room: None,
            duration_secs: 0,
            pending: None,
            early_candidates: Vec::new(),
            duration_timer: None,
            ring_timer: None,
        }
    }

    fn remote_id(&self) -> Option<String> {
        self.remote.as_ref().map(|r| r.id.clone())
    }
}

struct OrchestratorInner {
    transport: Arc<dyn SignalingTransport>,
    media_source: Arc<dyn MediaSource>,
    config: CallConfig,
    state: Mutex<CallInner>,
    session: Mutex<Option<Arc<PeerSession>>>,
    event_tx: broadcast::Sender<CallEvent>,
}

// ============================================================================
// CALL ORCHESTRATOR
// ============================================================================

/// Orchestriert genau einen Anruf zur Zeit
///
/// Peer Session und CallState werden ausschließlich hier mutiert; alle
/// Operationen prüfen die aktuelle Phase, bevor sie wirken.
#[derive(Clone)]
pub struct CallOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl CallOrchestrator {
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        media_source: Arc<dyn MediaSource>,
        config: CallConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            inner: Arc::new(OrchestratorInner {
                transport,
                media_source,
                config,
                state: Mutex::new(CallInner::new()),
                session: Mutex::new(None),
                event_tx,
            }),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Aktuelle Phase
    pub fn phase(&self) -> CallPhase {
        self.inner.state.lock().phase
    }

    /// Schnappschuss des Anruf-Zustands
    pub fn info(&self) -> CallInfo {
        let state = self.inner.state.lock();
        CallInfo {
            phase: state.phase,
            direction: state.direction,
            kind: state.kind,
            remote: state.remote.clone(),
            room: state.room.clone(),
            duration_secs: state.duration_secs,
        }
    }

    /// Konsumiert Signaling-Events aus einem Receiver in einem Task
    pub fn spawn_event_loop(
        &self,
        mut rx: broadcast::Receiver<SignalingEvent>,
    ) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => orchestrator.handle_signaling_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Signaling event loop lagged, {} events dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // ========================================================================
    // LOCAL INTENTS
    // ========================================================================

    /// Startet einen ausgehenden Anruf
    ///
    /// Schlägt fehl, wenn bereits ein Anruf läuft oder klingelt; der
    /// bestehende Zustand bleibt dann unverändert.
    pub async fn start_call(
        &self,
        to_id: &str,
        to_name: &str,
        kind: CallKind,
    ) -> Result<(), CallError> {
        let generation = {
            let mut state = self.inner.state.lock();
            if state.phase != CallPhase::Idle {
                return Err(CallError::AlreadyInCall);
            }
            state.generation += 1;
            state.phase = CallPhase::OutgoingRinging;
            state.direction = Some(CallDirection::Outgoing);
            state.kind = Some(kind);
            state.remote = Some(RemoteParty {
                id: to_id.to_string(),
                name: to_name.to_string(),
            });
            state.generation
        };
        self.emit(CallEvent::PhaseChanged(CallPhase::OutgoingRinging));

        tracing::info!("Starting {:?} call to {}", kind, to_id);
        match self.setup_outgoing(generation, to_id, kind).await {
            Ok(()) => Ok(()),
            Err(CallError::Cancelled) => Err(CallError::Cancelled),
            Err(e) => {
                self.fail_call(generation, &e).await;
                Err(e)
            }
        }
    }

    /// Nimmt den klingelnden Anruf an
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let (generation, invitation) = {
            let mut state = self.inner.state.lock();
            if state.phase != CallPhase::IncomingRinging {
                return Err(CallError::NotRinging);
            }
            let invitation = state.pending.take().ok_or(CallError::NotRinging)?;
            if let Some(timer) = state.ring_timer.take() {
                timer.abort();
            }
            state.phase = CallPhase::Connecting;
            state.room = invitation.room.clone();
            (state.generation, invitation)
        };
        self.emit(CallEvent::PhaseChanged(CallPhase::Connecting));

        tracing::info!("Accepting call from {}", invitation.caller.id);
        match self.setup_incoming(generation, &invitation).await {
            Ok(()) => Ok(()),
            Err(CallError::Cancelled) => Err(CallError::Cancelled),
            Err(e) => {
                self.fail_call(generation, &e).await;
                Err(e)
            }
        }
    }

    /// Lehnt den klingelnden Anruf ab
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let caller = {
            let state = self.inner.state.lock();
            if state.phase != CallPhase::IncomingRinging {
                return Err(CallError::NotRinging);
            }
            state.remote_id().ok_or(CallError::NotRinging)?
        };

        tracing::info!("Rejecting call from {}", caller);
        self.transition_to_idle(EndReason::Hangup).await;
        let _ = self
            .inner
            .transport
            .send_bye(&caller, Some(ByeReason::Reject))
            .await;
        Ok(())
    }

    /// Beendet den laufenden Anruf aus jeder Nicht-Idle-Phase
    pub async fn end_call(&self) -> Result<(), CallError> {
        let remote = {
            let state = self.inner.state.lock();
            if state.phase == CallPhase::Idle {
                return Err(CallError::NoActiveCall);
            }
            state.remote_id()
        };

        tracing::info!("Ending call");
        self.transition_to_idle(EndReason::Hangup).await;
        if let Some(remote) = remote {
            let _ = self.inner.transport.send_bye(&remote, None).await;
        }
        Ok(())
    }

    // ========================================================================
    // TOGGLES
    // ========================================================================

    /// Schaltet das Mikrofon stumm bzw. wieder ein
    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        Ok(self.current_session()?.toggle_mute())
    }

    /// Schaltet den Video-Track ein bzw. aus
    pub fn toggle_video(&self) -> Result<bool, CallError> {
        Ok(self.current_session()?.toggle_video())
    }

    /// Wechselt die Audio-Ausgabe-Route
    pub fn toggle_speaker(&self) -> Result<crate::media::SpeakerRoute, CallError> {
        Ok(self.current_session()?.toggle_speaker())
    }

    /// Wechselt die Kamera
    pub fn switch_camera(&self) -> Result<crate::media::CameraFacing, CallError> {
        Ok(self.current_session()?.switch_camera())
    }

    fn current_session(&self) -> Result<Arc<PeerSession>, CallError> {
        self.inner
            .session
            .lock()
            .clone()
            .ok_or(CallError::NoActiveCall)
    }

    // ========================================================================
    // INBOUND SIGNALING
    // ========================================================================

    /// Verarbeitet ein eingehendes Signaling-Event
    pub async fn handle_signaling_event(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::Offer {
                from,
                from_name,
                sdp,
                room,
            } => self.handle_offer(from, from_name, sdp, room).await,

            SignalingEvent::Answer { from, sdp } => self.handle_answer(from, sdp).await,

            SignalingEvent::Candidate { from, candidate } => {
                self.handle_candidate(from, candidate).await
            }

            SignalingEvent::Bye { from, reason } => self.handle_bye(from, reason).await,

            SignalingEvent::Left { id, .. } => self.handle_left(id).await,

            SignalingEvent::Reconnected(_) => {
                // Frische Session nach Reconnect: ein laufender Anruf ist
                // nicht fortsetzbar, zurück nach Idle
                if self.phase() != CallPhase::Idle {
                    tracing::warn!("Reconnected with fresh session, collapsing current call");
                    self.transition_to_idle(EndReason::ConnectionLost).await;
                }
            }

            SignalingEvent::ReconnectFailed => {
                if self.phase() != CallPhase::Idle {
                    self.transition_to_idle(EndReason::ConnectionLost).await;
                }
                self.emit(CallEvent::Error {
                    message: "Connection to relay lost".to_string(),
                });
            }

            // Transiente Trennungen überbrückt der Reconnect des Clients
            SignalingEvent::Disconnected
            | SignalingEvent::Connected(_)
            | SignalingEvent::Joined { .. }
            | SignalingEvent::Users(_)
            | SignalingEvent::Status { .. } => {}

            SignalingEvent::Error { message } => {
                self.emit(CallEvent::Error { message });
            }
        }
    }

    async fn handle_offer(
        &self,
        from: String,
        from_name: Option<String>,
        sdp: String,
        room: Option<String>,
    ) {
        let (caller, kind) = {
            let mut state = self.inner.state.lock();
            if state.phase != CallPhase::Idle {
                let is_current_remote = state.remote_id().as_deref() == Some(from.as_str());
                drop(state);
                if is_current_remote {
                    // Doppeltes Offer der aktuellen Gegenseite: ignorieren
                    tracing::debug!("Ignoring duplicate offer from {}", from);
                } else {
                    // Zweiter Anrufer: besetzt melden, laufenden Anruf nicht anfassen
                    tracing::info!("Busy, declining offer from {}", from);
                    let transport = Arc::clone(&self.inner.transport);
                    tokio::spawn(async move {
                        let _ = transport.send_bye(&from, Some(ByeReason::Busy)).await;
                    });
                }
                return;
            }

            let kind = if sdp_wants_video(&sdp) {
                CallKind::Video
            } else {
                CallKind::Audio
            };
            let caller = RemoteParty {
                name: from_name.unwrap_or_else(|| from.clone()),
                id: from,
            };

            state.generation += 1;
            state.phase = CallPhase::IncomingRinging;
            state.direction = Some(CallDirection::Incoming);
            state.kind = Some(kind);
            state.remote = Some(caller.clone());
            state.pending = Some(PendingInvitation {
                caller: caller.clone(),
                kind,
                offer_sdp: sdp,
                room,
            });
            let generation = state.generation;
            state.ring_timer = Some(self.spawn_ring_timer(generation));
            (caller, kind)
        };

        tracing::info!("Incoming {:?} call from {}", kind, caller.id);
        self.emit(CallEvent::PhaseChanged(CallPhase::IncomingRinging));
        self.emit(CallEvent::Ring { caller, kind });
    }

    async fn handle_answer(&self, from: String, sdp: String) {
        let (generation, session) = {
            let state = self.inner.state.lock();
            if state.phase != CallPhase::OutgoingRinging
                || state.remote_id().as_deref() != Some(from.as_str())
            {
                tracing::debug!("Ignoring unexpected answer from {}", from);
                return;
            }
            (state.generation, self.inner.session.lock().clone())
        };

        let session = match session {
            Some(session) => session,
            None => return,
        };

        if let Err(e) = session.apply_remote_answer(sdp).await {
            tracing::error!("Failed to apply remote answer: {}", e);
            self.fail_call(generation, &CallError::Negotiation(e)).await;
            return;
        }

        // Nach dem Await: Phase kann inzwischen zurückgesetzt sein
        {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                return;
            }
            state.phase = CallPhase::Connecting;
        }
        self.emit(CallEvent::PhaseChanged(CallPhase::Connecting));
    }

    async fn handle_candidate(&self, from: String, candidate: CandidateInit) {
        let session = {
            let mut state = self.inner.state.lock();
            if state.remote_id().as_deref() != Some(from.as_str()) {
                tracing::debug!("Ignoring candidate from unrelated endpoint {}", from);
                return;
            }
            let session = self.inner.session.lock().clone();
            if session.is_none() {
                // Session existiert noch nicht (z.B. Klingeln): puffern,
                // wird beim Setup in Ankunftsreihenfolge nachgereicht
                state.early_candidates.push(candidate);
                return;
            }
            session
        };

        if let Some(session) = session {
            session.add_remote_candidate(candidate).await;
        }
    }

    async fn handle_bye(&self, from: String, reason: Option<ByeReason>) {
        let relevant = {
            let state = self.inner.state.lock();
            state.phase != CallPhase::Idle
                && state.remote_id().as_deref() == Some(from.as_str())
        };
        if !relevant {
            return;
        }

        let reason = EndReason::from_bye(reason);
        tracing::info!("Received bye from {}: {}", from, reason.user_message());
        self.transition_to_idle(reason).await;
    }

    async fn handle_left(&self, id: String) {
        let relevant = {
            let state = self.inner.state.lock();
            state.phase != CallPhase::Idle && state.remote_id().as_deref() == Some(id.as_str())
        };
        if !relevant {
            return;
        }

        tracing::info!("Remote party {} left", id);
        self.transition_to_idle(EndReason::RemoteHangup).await;
    }

    // ========================================================================
    // PEER EVENTS
    // ========================================================================

    async fn handle_peer_event(&self, generation: u64, event: PeerEvent) {
        match event {
            PeerEvent::ConnectionState(state) => {
                self.handle_connection_state(generation, state).await
            }

            PeerEvent::LocalCandidate(candidate) => {
                let remote = {
                    let state = self.inner.state.lock();
                    if state.generation != generation {
                        return;
                    }
                    state.remote_id()
                };
                if let Some(remote) = remote {
                    if let Err(e) = self
                        .inner
                        .transport
                        .send_candidate(&remote, candidate)
                        .await
                    {
                        tracing::warn!("Failed to send local candidate: {}", e);
                    }
                }
            }

            PeerEvent::RemoteTrack { mime_type } => {
                tracing::debug!("Remote track available: {}", mime_type);
            }
        }
    }

    async fn handle_connection_state(&self, generation: u64, state: RTCPeerConnectionState) {
        match state {
            RTCPeerConnectionState::Connected => {
                let activated = {
                    let mut inner = self.inner.state.lock();
                    if inner.generation != generation || inner.phase != CallPhase::Connecting {
                        false
                    } else {
                        inner.phase = CallPhase::Active;
                        inner.duration_secs = 0;
                        inner.duration_timer = Some(self.spawn_duration_timer(generation));
                        true
                    }
                };
                if activated {
                    tracing::info!("Call is active, media flowing");
                    self.emit(CallEvent::PhaseChanged(CallPhase::Active));
                }
            }

            RTCPeerConnectionState::Disconnected
            | RTCPeerConnectionState::Failed
            | RTCPeerConnectionState::Closed => {
                let relevant = {
                    let inner = self.inner.state.lock();
                    inner.generation == generation
                        && matches!(inner.phase, CallPhase::Connecting | CallPhase::Active)
                };
                if relevant {
                    tracing::warn!("Peer connection lost ({:?})", state);
                    self.transition_to_idle(EndReason::ConnectionLost).await;
                }
            }

            _ => {}
        }
    }

    // ========================================================================
    // CALL SETUP
    // ========================================================================

    async fn setup_outgoing(
        &self,
        generation: u64,
        to: &str,
        kind: CallKind,
    ) -> Result<(), CallError> {
        let media = self
            .inner
            .media_source
            .acquire(&MediaConstraints::for_call(kind == CallKind::Video))
            .await?;
        self.check_generation(generation)?;

        let session = Arc::new(PeerSession::new(self.inner.transport.ice_servers(), media));
        self.install_session(generation, &session).await?;

        // Frisch benannter Raum für genau diesen Anruf
        let local = self.inner.transport.local_id().unwrap_or_default();
        let room = format!("{}-{}-{}", local, to, Uuid::new_v4());
        {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                return Err(CallError::Cancelled);
            }
            state.room = Some(room.clone());
        }

        self.inner.transport.join_room(&room).await?;
        self.check_generation(generation)?;

        let offer = session.create_offer().await?;
        self.check_generation(generation)?;

        self.inner
            .transport
            .send_offer(to, offer, Some(room))
            .await?;
        Ok(())
    }

    async fn setup_incoming(
        &self,
        generation: u64,
        invitation: &PendingInvitation,
    ) -> Result<(), CallError> {
        let media = self
            .inner
            .media_source
            .acquire(&MediaConstraints::for_call(
                invitation.kind == CallKind::Video,
            ))
            .await?;
        self.check_generation(generation)?;

        let session = Arc::new(PeerSession::new(self.inner.transport.ice_servers(), media));
        self.install_session(generation, &session).await?;

        if let Some(room) = &invitation.room {
            self.inner.transport.join_room(room).await?;
            self.check_generation(generation)?;
        }

        // Früh eingetroffene Candidates vor der Description einreihen
        let early: Vec<CandidateInit> = {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                return Err(CallError::Cancelled);
            }
            std::mem::take(&mut state.early_candidates)
        };
        for candidate in early {
            session.add_remote_candidate(candidate).await;
        }

        let answer = session.apply_remote_offer(invitation.offer_sdp.clone()).await?;
        self.check_generation(generation)?;

        self.inner
            .transport
            .send_answer(&invitation.caller.id, answer)
            .await?;
        Ok(())
    }

    /// Hinterlegt die Peer Session und startet den Event-Pump
    async fn install_session(
        &self,
        generation: u64,
        session: &Arc<PeerSession>,
    ) -> Result<(), CallError> {
        {
            let state = self.inner.state.lock();
            if state.generation != generation {
                drop(state);
                session.teardown().await;
                return Err(CallError::Cancelled);
            }
            *self.inner.session.lock() = Some(Arc::clone(session));
        }

        let mut rx = session.subscribe();
        let orchestrator = self.clone();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if orchestrator.inner.state.lock().generation != generation {
                    break;
                }
                orchestrator.handle_peer_event(generation, event).await;
            }
        });
        Ok(())
    }

    // ========================================================================
    // TRANSITIONS
    // ========================================================================

    fn check_generation(&self, generation: u64) -> Result<(), CallError> {
        if self.inner.state.lock().generation != generation {
            return Err(CallError::Cancelled);
        }
        Ok(())
    }

    /// Fehlerpfad: Anruf kollabiert nach Idle, Gegenseite bekommt ein
    /// Bye("abort"), die UI eine kurze Meldung
    async fn fail_call(&self, generation: u64, error: &CallError) {
        let remote = {
            let state = self.inner.state.lock();
            if state.generation != generation || state.phase == CallPhase::Idle {
                return;
            }
            state.remote_id()
        };

        tracing::error!("Call failed: {}", error);
        self.emit(CallEvent::Error {
            message: error.to_string(),
        });
        self.transition_to_idle(EndReason::Aborted).await;

        if let Some(remote) = remote {
            if !matches!(error, CallError::Media(_)) {
                let _ = self
                    .inner
                    .transport
                    .send_bye(&remote, Some(ByeReason::Abort))
                    .await;
            }
        }
    }

    /// Der eine Ausgang: Timer stoppen, Peer Session abbauen, Raum
    /// verlassen, Zustand leeren
    async fn transition_to_idle(&self, reason: EndReason) {
        let (session, room) = {
            let mut state = self.inner.state.lock();
            if state.phase == CallPhase::Idle {
                return;
            }
            state.generation += 1;
            if let Some(timer) = state.duration_timer.take() {
                timer.abort();
            }
            if let Some(timer) = state.ring_timer.take() {
                timer.abort();
            }
            state.phase = CallPhase::Ended;
            state.direction = None;
            state.kind = None;
            state.remote = None;
            state.pending = None;
            state.early_candidates.clear();
            state.duration_secs = 0;
            (self.inner.session.lock().take(), state.room.take())
        };

        self.emit(CallEvent::PhaseChanged(CallPhase::Ended));
        self.emit(CallEvent::Ended { reason });

        if let Some(session) = session {
            session.teardown().await;
        }
        if room.is_some() {
            if let Err(e) = self.inner.transport.leave_room().await {
                tracing::debug!("Failed to leave room: {}", e);
            }
        }

        self.inner.state.lock().phase = CallPhase::Idle;
        self.emit(CallEvent::PhaseChanged(CallPhase::Idle));
    }

    // ========================================================================
    // TIMERS
    // ========================================================================

    /// Dauer-Timer, streng an die Active-Phase gebunden
    fn spawn_duration_timer(&self, generation: u64) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            ticker.tick().await; // erster Tick feuert sofort
            loop {
                ticker.tick().await;
                let seconds = {
                    let mut state = orchestrator.inner.state.lock();
                    if state.generation != generation || state.phase != CallPhase::Active {
                        break;
                    }
                    state.duration_secs += 1;
                    state.duration_secs
                };
                orchestrator.emit(CallEvent::Tick { seconds });
            }
        })
    }

    /// Klingel-Timeout für unbeantwortete eingehende Anrufe
    fn spawn_ring_timer(&self, generation: u64) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let timeout = self.inner.config.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let caller = {
                let state = orchestrator.inner.state.lock();
                if state.generation != generation || state.phase != CallPhase::IncomingRinging {
                    return;
                }
                state.remote_id()
            };

            tracing::info!("Incoming call not answered in time");
            orchestrator
                .transition_to_idle(EndReason::PickupTimeout)
                .await;
            if let Some(caller) = caller {
                let _ = orchestrator
                    .inner
                    .transport
                    .send_bye(&caller, Some(ByeReason::Pickuptimeout))
                    .await;
            }
        })
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.inner.event_tx.send(event);
    }
}

impl std::fmt::Debug for CallOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOrchestrator")
            .field("info", &self.info())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LocalMedia, StaticMediaSource};
    use crate::signaling::IceServerConfig;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Join(String),
        Leave,
        Offer { to: String, room: Option<String> },
        Answer { to: String },
        Candidate { to: String },
        Bye { to: String, reason: Option<ByeReason> },
    }

    #[derive(Default)]
    struct MockTransport {
        sent: Mutex<Vec<Sent>>,
        last_offer_sdp: Mutex<Option<String>>,
    }

    impl MockTransport {
        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().clone()
        }

        fn last(&self) -> Option<Sent> {
            self.sent.lock().last().cloned()
        }
    }

    #[async_trait]
    impl SignalingTransport for MockTransport {
        fn local_id(&self) -> Option<String> {
            Some("alice".to_string())
        }

        fn ice_servers(&self) -> Vec<IceServerConfig> {
            vec![]
        }

        async fn join_room(&self, name: &str) -> Result<(), SignalingError> {
            self.sent.lock().push(Sent::Join(name.to_string()));
            Ok(())
        }

        async fn leave_room(&self) -> Result<(), SignalingError> {
            self.sent.lock().push(Sent::Leave);
            Ok(())
        }

        async fn send_offer(
            &self,
            to: &str,
            sdp: String,
            room: Option<String>,
        ) -> Result<(), SignalingError> {
            *self.last_offer_sdp.lock() = Some(sdp);
            self.sent.lock().push(Sent::Offer {
                to: to.to_string(),
                room,
            });
            Ok(())
        }

        async fn send_answer(&self, to: &str, _sdp: String) -> Result<(), SignalingError> {
            self.sent.lock().push(Sent::Answer { to: to.to_string() });
            Ok(())
        }

        async fn send_candidate(
            &self,
            to: &str,
            _candidate: CandidateInit,
        ) -> Result<(), SignalingError> {
            self.sent.lock().push(Sent::Candidate { to: to.to_string() });
            Ok(())
        }

        async fn send_bye(&self, to: &str, reason: Option<ByeReason>) -> Result<(), SignalingError> {
            self.sent.lock().push(Sent::Bye {
                to: to.to_string(),
                reason,
            });
            Ok(())
        }
    }

    /// Medienquelle, die Permission verweigert
    struct DeniedMediaSource;

    #[async_trait]
    impl MediaSource for DeniedMediaSource {
        async fn acquire(&self, _c: &MediaConstraints) -> Result<LocalMedia, MediaError> {
            Err(MediaError::PermissionDenied)
        }
    }

    /// Medienquelle mit Verzögerung, um Abbruch während des Setups zu testen
    struct SlowMediaSource;

    #[async_trait]
    impl MediaSource for SlowMediaSource {
        async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            StaticMediaSource.acquire(constraints).await
        }
    }

    fn orchestrator(transport: &Arc<MockTransport>) -> CallOrchestrator {
        CallOrchestrator::new(
            Arc::clone(transport) as Arc<dyn SignalingTransport>,
            Arc::new(StaticMediaSource),
            CallConfig::default(),
        )
    }

    /// Erzeugt ein echtes Offer-SDP einer zweiten Peer Session
    async fn remote_offer_sdp() -> String {
        let media = StaticMediaSource
            .acquire(&MediaConstraints::for_call(false))
            .await
            .unwrap();
        let session = PeerSession::new(vec![], media);
        session.create_offer().await.unwrap()
    }

    fn offer_event(from: &str, sdp: String, room: Option<&str>) -> SignalingEvent {
        SignalingEvent::Offer {
            from: from.to_string(),
            from_name: Some("Bob".to_string()),
            sdp,
            room: room.map(|r| r.to_string()),
        }
    }

    #[tokio::test]
    async fn test_start_call_joins_room_and_sends_offer() {
        let transport = Arc::new(MockTransport::default());
        let orch = orchestrator(&transport);

        orch.start_call("bob", "Bob", CallKind::Audio).await.unwrap();
        assert_eq!(orch.phase(), CallPhase::OutgoingRinging);

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        let room = match &sent[0] {
            Sent::Join(room) => room.clone(),
            other => panic!("expected join, got {other:?}"),
        };
        assert!(room.starts_with("alice-bob-"));
        assert_eq!(
            sent[1],
            Sent::Offer {
                to: "bob".to_string(),
                room: Some(room),
            }
        );
    }

    #[tokio::test]
    async fn test_start_call_while_busy_is_rejected() {
        let transport = Arc::new(MockTransport::default());
        let orch = orchestrator(&transport);

        orch.start_call("bob", "Bob", CallKind::Audio).await.unwrap();
        let before = orch.info();

        let result = orch.start_call("carol", "Carol", CallKind::Video).await;
        assert!(matches!(result, Err(CallError::AlreadyInCall)));

        // Bestehender Zustand bleibt unangetastet
        let after = orch.info();
        assert_eq!(after.phase, CallPhase::OutgoingRinging);
        assert_eq!(after.remote, before.remote);
        assert_eq!(after.kind, before.kind);
    }

    #[tokio::test]
    async fn test_incoming_offer_rings_without_media() {
        let transport = Arc::new(MockTransport::default());
        let orch = orchestrator(&transport);
        let mut events = orch.subscribe();

        orch.handle_signaling_event(offer_event("bob", "v=0\r\n".to_string(), Some("room-1")))
            .await;

        assert_eq!(orch.phase(), CallPhase::IncomingRinging);
        assert_eq!(orch.info().kind, Some(CallKind::Audio));
        // Noch keine Peer Session, noch keine Medien
        assert!(orch.inner.session.lock().is_none());

        // Ring-Event mit Anrufer-Beschreibung
        assert!(matches!(
            events.recv().await.unwrap(),
            CallEvent::PhaseChanged(CallPhase::IncomingRinging)
        ));
        match events.recv().await.unwrap() {
            CallEvent::Ring { caller, kind } => {
                assert_eq!(caller.id, "bob");
                assert_eq!(caller.name, "Bob");
                assert_eq!(kind, CallKind::Audio);
            }
            other => panic!("expected ring, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reject_sends_bye_reject_and_returns_to_idle() {
        let transport = Arc::new(MockTransport::default());
        let orch = orchestrator(&transport);

        orch.handle_signaling_event(offer_event("bob", "v=0\r\n".to_string(), Some("room-1")))
            .await;
        orch.reject_call().await.unwrap();

        assert_eq!(orch.phase(), CallPhase::Idle);
        assert_eq!(
            transport.last(),
            Some(Sent::Bye {
                to: "bob".to_string(),
                reason: Some(ByeReason::Reject),
            })
        );
        assert!(matches!(orch.toggle_mute(), Err(CallError::NoActiveCall)));
    }

    #[tokio::test]
    async fn test_accept_call_walks_to_active() {
        let transport = Arc::new(MockTransport::default());
        let orch = orchestrator(&transport);

        let sdp = remote_offer_sdp().await;
        orch.handle_signaling_event(offer_event("bob", sdp, Some("room-1")))
            .await;
        orch.accept_call().await.unwrap();

        assert_eq!(orch.phase(), CallPhase::Connecting);
        let sent = transport.sent();
        assert!(sent.contains(&Sent::Join("room-1".to_string())));
        assert!(sent.contains(&Sent::Answer {
            to: "bob".to_string()
        }));
        // Einladung ist verbraucht
        assert!(orch.inner.state.lock().pending.is_none());

        // Medienfluss steht: Connecting -> Active mit Dauer-Timer
        let generation = orch.inner.state.lock().generation;
        orch.handle_connection_state(generation, RTCPeerConnectionState::Connected)
            .await;
        assert_eq!(orch.phase(), CallPhase::Active);
        assert!(orch.inner.state.lock().duration_timer.is_some());

        // Auflegen: Bye an die Gegenseite, Timer weg, Idle
        orch.end_call().await.unwrap();
        assert_eq!(orch.phase(), CallPhase::Idle);
        assert!(orch.inner.state.lock().duration_timer.is_none());
        assert_eq!(
            transport.last(),
            Some(Sent::Bye {
                to: "bob".to_string(),
                reason: None,
            })
        );
    }

    #[tokio::test]
    async fn test_busy_and_reject_are_distinct_end_reasons() {
        let transport = Arc::new(MockTransport::default());
        let orch = orchestrator(&transport);
        let mut events = orch.subscribe();

        orch.start_call("bob", "Bob", CallKind::Audio).await.unwrap();
        orch.handle_signaling_event(SignalingEvent::Bye {
            from: "bob".to_string(),
            reason: Some(ByeReason::Busy),
        })
        .await;

        assert_eq!(orch.phase(), CallPhase::Idle);
        let mut ended = None;
        while let Ok(event) = events.try_recv() {
            if let CallEvent::Ended { reason } = event {
                ended = Some(reason);
            }
        }
        assert_eq!(ended, Some(EndReason::RemoteBusy));
        assert_ne!(
            EndReason::RemoteBusy.user_message(),
            EndReason::RemoteRejected.user_message()
        );
    }

    #[tokio::test]
    async fn test_bye_tears_down_session_exactly_once() {
        let transport = Arc::new(MockTransport::default());
        let orch = orchestrator(&transport);

        let sdp = remote_offer_sdp().await;
        orch.handle_signaling_event(offer_event("bob", sdp, Some("room-1")))
            .await;
        orch.accept_call().await.unwrap();

        let session = orch.inner.session.lock().clone().unwrap();
        assert!(!session.is_torn_down());

        orch.handle_signaling_event(SignalingEvent::Bye {
            from: "bob".to_string(),
            reason: None,
        })
        .await;

        assert_eq!(orch.phase(), CallPhase::Idle);
        assert!(session.is_torn_down());
        assert!(session.media().is_stopped());
        assert!(orch.inner.session.lock().is_none());

        // Zweites Bye ist wirkungslos
        orch.handle_signaling_event(SignalingEvent::Bye {
            from: "bob".to_string(),
            reason: None,
        })
        .await;
        assert_eq!(orch.phase(), CallPhase::Idle);
    }

    #[tokio::test]
    async fn test_bye_from_stranger_is_ignored() {
        let transport = Arc::new(MockTransport::default());
        let orch = orchestrator(&transport);

        orch.start_call("bob", "Bob", CallKind::Audio).await.unwrap();
        orch.handle_signaling_event(SignalingEvent::Bye {
            from: "carol".to_string(),
            reason: None,
        })
        .await;

        assert_eq!(orch.phase(), CallPhase::OutgoingRinging);
    }

    #[tokio::test]
    async fn test_second_caller_gets_busy() {
        let transport = Arc::new(MockTransport::default());
        let orch = orchestrator(&transport);

        orch.start_call("bob", "Bob", CallKind::Audio).await.unwrap();
        orch.handle_signaling_event(offer_event("carol", "v=0\r\n".to_string(), Some("room-2")))
            .await;

        // Busy-Antwort läuft in einem eigenen Task
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transport.sent().contains(&Sent::Bye {
            to: "carol".to_string(),
            reason: Some(ByeReason::Busy),
        }));
        // Der laufende Anruf bleibt unberührt
        assert_eq!(orch.phase(), CallPhase::OutgoingRinging);
        assert_eq!(orch.info().remote.unwrap().id, "bob");
    }

    #[tokio::test]
    async fn test_media_denied_reverts_to_idle() {
        let transport = Arc::new(MockTransport::default());
        let orch = CallOrchestrator::new(
            Arc::clone(&transport) as Arc<dyn SignalingTransport>,
            Arc::new(DeniedMediaSource),
            CallConfig::default(),
        );
        let mut events = orch.subscribe();

        let result = orch.start_call("bob", "Bob", CallKind::Audio).await;
        assert!(matches!(result, Err(CallError::Media(_))));
        assert_eq!(orch.phase(), CallPhase::Idle);

        // Kein Offer gesendet, kein Bye (Medienfehler bleibt lokal)
        assert!(transport.sent().is_empty());

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CallEvent::Error { .. }) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_end_during_setup_makes_late_result_inert() {
        let transport = Arc::new(MockTransport::default());
        let orch = CallOrchestrator::new(
            Arc::clone(&transport) as Arc<dyn SignalingTransport>,
            Arc::new(SlowMediaSource),
            CallConfig::default(),
        );

        let background = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.start_call("bob", "Bob", CallKind::Audio).await })
        };

        // Abbruch, während die Medienakquise noch läuft
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orch.phase(), CallPhase::OutgoingRinging);
        orch.end_call().await.unwrap();

        let result = background.await.unwrap();
        assert!(matches!(result, Err(CallError::Cancelled)));
        assert_eq!(orch.phase(), CallPhase::Idle);
        assert!(orch.inner.session.lock().is_none());
        // Das verspätete Ergebnis hat kein Offer mehr ausgelöst
        assert!(!transport
            .sent()
            .iter()
            .any(|s| matches!(s, Sent::Offer { .. })));
    }

    #[tokio::test]
    async fn test_ring_timeout_expires_invitation() {
        let transport = Arc::new(MockTransport::default());
        let orch = CallOrchestrator::new(
            Arc::clone(&transport) as Arc<dyn SignalingTransport>,
            Arc::new(StaticMediaSource),
            CallConfig {
                ring_timeout: Duration::from_millis(100),
            },
        );

        orch.handle_signaling_event(offer_event("bob", "v=0\r\n".to_string(), Some("room-1")))
            .await;
        assert_eq!(orch.phase(), CallPhase::IncomingRinging);

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(orch.phase(), CallPhase::Idle);
        assert!(orch.inner.state.lock().pending.is_none());
        assert!(transport.sent().contains(&Sent::Bye {
            to: "bob".to_string(),
            reason: Some(ByeReason::Pickuptimeout),
        }));
    }

    #[tokio::test]
    async fn test_candidates_before_accept_are_buffered() {
        let transport = Arc::new(MockTransport::default());
        let orch = orchestrator(&transport);

        let sdp = remote_offer_sdp().await;
        orch.handle_signaling_event(offer_event("bob", sdp, Some("room-1")))
            .await;

        // Candidates treffen ein, bevor die Peer Session existiert
        for n in 0..3u16 {
            orch.handle_signaling_event(SignalingEvent::Candidate {
                from: "bob".to_string(),
                candidate: CandidateInit {
                    sdp_mline_index: Some(0),
                    sdp_mid: Some("0".to_string()),
                    candidate: format!(
                        "candidate:{n} 1 udp 2130706431 127.0.0.1 {} typ host",
                        51000 + n
                    ),
                },
            })
            .await;
        }
        assert_eq!(orch.inner.state.lock().early_candidates.len(), 3);

        // Candidate eines Unbeteiligten wird verworfen
        orch.handle_signaling_event(SignalingEvent::Candidate {
            from: "carol".to_string(),
            candidate: CandidateInit::default(),
        })
        .await;
        assert_eq!(orch.inner.state.lock().early_candidates.len(), 3);

        // Accept reicht die gepufferten Candidates an die Session durch
        orch.accept_call().await.unwrap();
        assert!(orch.inner.state.lock().early_candidates.is_empty());
        let session = orch.inner.session.lock().clone().unwrap();
        // Queue ist nach der Remote Description geleert
        assert_eq!(session.pending_candidates(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_forces_idle() {
        let transport = Arc::new(MockTransport::default());
        let orch = orchestrator(&transport);

        orch.start_call("bob", "Bob", CallKind::Audio).await.unwrap();
        assert_eq!(orch.phase(), CallPhase::OutgoingRinging);

        orch.handle_signaling_event(SignalingEvent::Reconnected(crate::signaling::Session {
            id: "new-id".to_string(),
            sid: "new-sid".to_string(),
            token: "tok".to_string(),
            stun: vec![],
            turn: None,
        }))
        .await;

        assert_eq!(orch.phase(), CallPhase::Idle);
        assert!(orch.inner.session.lock().is_none());
    }

    #[tokio::test]
    async fn test_answer_moves_outgoing_to_connecting() {
        let transport = Arc::new(MockTransport::default());
        let orch = orchestrator(&transport);

        orch.start_call("bob", "Bob", CallKind::Audio).await.unwrap();

        // Gegenseite beantwortet das gesendete Offer
        let offer_sdp = transport.last_offer_sdp.lock().clone().unwrap();
        let media = StaticMediaSource
            .acquire(&MediaConstraints::for_call(false))
            .await
            .unwrap();
        let callee = PeerSession::new(vec![], media);
        let answer_sdp = callee.apply_remote_offer(offer_sdp).await.unwrap();

        orch.handle_signaling_event(SignalingEvent::Answer {
            from: "bob".to_string(),
            sdp: answer_sdp,
        })
        .await;

        assert_eq!(orch.phase(), CallPhase::Connecting);
    }

    #[tokio::test]
    async fn test_answer_from_stranger_is_ignored() {
        let transport = Arc::new(MockTransport::default());
        let orch = orchestrator(&transport);

        orch.start_call("bob", "Bob", CallKind::Audio).await.unwrap();
        orch.handle_signaling_event(SignalingEvent::Answer {
            from: "carol".to_string(),
            sdp: "v=0\r\n".to_string(),
        })
        .await;

        assert_eq!(orch.phase(), CallPhase::OutgoingRinging);
    }
}
