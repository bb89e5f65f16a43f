//! WebSocket-Client für das Rendezvous-Relay
//!
//! Verwaltet die eine persistente Verbindung zum Relay:
//! - Hello/Self-Handshake mit Session-Identität und ICE-Servern
//! - Keepalive über Alive-Dokumente
//! - Sende-Queue bei getrennter Verbindung
//! - Automatische Reconnection mit exponentiellem Backoff
//! - Event-basierte Zustellung eingehender Dokumente

use super::documents::*;
use crate::config::ClientConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Protokoll-Version im Hello-Dokument
pub const PROTOCOL_VERSION: &str = "1.0";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Not connected to signaling relay")]
    NotConnected,

    #[error("Failed to send document: {0}")]
    SendFailed(String),
}

// ============================================================================
// SESSION
// ============================================================================

/// TURN-Credentials mit Ausgabezeitpunkt
#[derive(Debug, Clone)]
pub struct TurnCredentials {
    pub username: String,
    pub password: String,
    pub ttl: Duration,
    pub urls: Vec<String>,
    pub issued_at: DateTime<Utc>,
}

impl TurnCredentials {
    /// Prüft, ob die Credentials ihre TTL überschritten haben
    pub fn is_expired(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.issued_at);
        age.num_seconds() >= self.ttl.as_secs() as i64
    }
}

/// Session-Identität aus dem Self-Dokument
///
/// Entsteht beim Handshake und wird beim Disconnect verworfen.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub sid: String,
    pub token: String,
    pub stun: Vec<String>,
    pub turn: Option<TurnCredentials>,
}

/// ICE-Server-Eintrag für die Peer Connection
#[derive(Debug, Clone, PartialEq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events, die der SignalingClient an Subscriber verteilt
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Handshake abgeschlossen, Session steht
    Connected(Session),

    /// Verbindung nach Abbruch wiederhergestellt (frische Session)
    Reconnected(Session),

    /// Verbindung getrennt; Reconnect läuft ggf. noch
    Disconnected,

    /// Alle Reconnect-Versuche erschöpft (terminal)
    ReconnectFailed,

    /// Eingehendes SDP Offer
    Offer {
        from: String,
        from_name: Option<String>,
        sdp: String,
        room: Option<String>,
    },

    /// Eingehendes SDP Answer
    Answer { from: String, sdp: String },

    /// Eingehender ICE Candidate
    Candidate { from: String, candidate: CandidateInit },

    /// Anruf beendet/abgelehnt
    Bye {
        from: String,
        reason: Option<ByeReason>,
    },

    /// Endpoint ist dem Raum beigetreten
    Joined {
        id: String,
        name: String,
        room: String,
    },

    /// Endpoint hat Raum/Verbindung verlassen
    Left { id: String, room: String },

    /// Teilnehmerliste des Raums
    Users(Vec<UserEntry>),

    /// Display-Name eines Endpoints hat sich geändert
    Status { from: String, name: String },

    /// Fehler vom Relay
    Error { message: String },
}

// ============================================================================
// TRANSPORT TRAIT
// ============================================================================

/// Die eine Call-Transport-Schnittstelle des Orchestrators
///
/// Einzige konkrete Implementierung ist der [`SignalingClient`];
/// Tests stellen einen Mock.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Eigene Endpoint-Id, falls eine Session besteht
    fn local_id(&self) -> Option<String>;

    /// Zum Anrufzeitpunkt gemergte ICE-Server (STUN + TURN)
    fn ice_servers(&self) -> Vec<IceServerConfig>;

    async fn join_room(&self, name: &str) -> Result<(), SignalingError>;

    async fn leave_room(&self) -> Result<(), SignalingError>;

    async fn send_offer(
        &self,
        to: &str,
        sdp: String,
        room: Option<String>,
    ) -> Result<(), SignalingError>;

    async fn send_answer(&self, to: &str, sdp: String) -> Result<(), SignalingError>;

    async fn send_candidate(
        &self,
        to: &str,
        candidate: CandidateInit,
    ) -> Result<(), SignalingError>;

    async fn send_bye(&self, to: &str, reason: Option<ByeReason>) -> Result<(), SignalingError>;
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Default)]
struct ClientState {
    connected: bool,
    session: Option<Session>,
    display_name: Option<String>,
    room: Option<String>,
    intentional_close: bool,
    reconnecting: bool,
}

struct ClientInner {
    config: ClientConfig,
    state: RwLock<ClientState>,
    tx: RwLock<Option<mpsc::Sender<Message>>>,
    pending: Mutex<VecDeque<SignalingDocument>>,
    self_waiter: Mutex<Option<oneshot::Sender<Session>>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// Client für die Kommunikation mit dem Rendezvous-Relay
///
/// Wird explizit konstruiert und injiziert; es gibt keinen globalen
/// Singleton.
pub struct SignalingClient {
    inner: Arc<ClientInner>,
}

impl SignalingClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            inner: Arc::new(ClientInner {
                config,
                state: RwLock::new(ClientState::default()),
                tx: RwLock::new(None),
                pending: Mutex::new(VecDeque::new()),
                self_waiter: Mutex::new(None),
                event_tx,
            }),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Aktuelle Session (falls verbunden)
    pub fn session(&self) -> Option<Session> {
        self.inner.state.read().session.clone()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.inner.state.read().connected
    }

    /// Aktuell gehaltener Raum
    pub fn room(&self) -> Option<String> {
        self.inner.state.read().room.clone()
    }

    /// Verbindet mit dem Relay und wartet auf das Self-Dokument
    ///
    /// Idempotent: liefert bei bestehender Verbindung die aktuelle
    /// Session zurück.
    pub async fn connect(&self, display_name: &str) -> Result<Session, SignalingError> {
        {
            let mut state = self.inner.state.write();
            if state.connected {
                if let Some(session) = &state.session {
                    return Ok(session.clone());
                }
            }
            state.display_name = Some(display_name.to_string());
            state.intentional_close = false;
        }

        let session = Self::establish(&self.inner).await?;
        let _ = self
            .inner
            .event_tx
            .send(SignalingEvent::Connected(session.clone()));
        Ok(session)
    }

    /// Trennt die Verbindung; löst keinen Reconnect aus
    pub async fn disconnect(&self) {
        self.inner.state.write().intentional_close = true;

        let tx = self.inner.tx.write().take();
        if let Some(tx) = tx {
            let _ = tx.send(Message::Close(None)).await;
        }
    }

    /// Tritt einem Raum bei; verlässt vorher einen ggf. gehaltenen Raum
    pub async fn join_room(&self, name: &str) -> Result<(), SignalingError> {
        let previous = self.inner.state.write().room.take();
        if previous.is_some() {
            self.send_now(&room_document("")).await?;
        }

        self.send_now(&room_document(name)).await?;
        self.inner.state.write().room = Some(name.to_string());
        Ok(())
    }

    /// Verlässt den gehaltenen Raum; No-op ohne Raum
    pub async fn leave_room(&self) -> Result<(), SignalingError> {
        let previous = self.inner.state.write().room.take();
        if previous.is_some() {
            self.send_now(&room_document("")).await?;
        }
        Ok(())
    }

    /// Propagiert einen geänderten Display-Namen
    pub async fn set_status(&self, name: &str) -> Result<(), SignalingError> {
        self.inner.state.write().display_name = Some(name.to_string());
        self.send_now(&SignalingDocument::Status {
            status: StatusPayload {
                name: name.to_string(),
                to: None,
            },
        })
        .await
    }

    // ========================================================================
    // SENDING
    // ========================================================================

    /// Sendet ein Dokument sofort; Fehler wenn nicht verbunden
    async fn send_now(&self, doc: &SignalingDocument) -> Result<(), SignalingError> {
        Self::transmit(&self.inner, doc).await
    }

    /// Sendet ein Dokument oder stellt es in die Sende-Queue
    ///
    /// Die Queue wird in Sendereihenfolge geleert, sobald wieder ein
    /// Self-Dokument empfangen wurde.
    async fn send_or_queue(&self, doc: SignalingDocument) -> Result<(), SignalingError> {
        if self.is_connected() {
            self.send_now(&doc).await
        } else {
            tracing::debug!("Not connected, queueing document");
            self.inner.pending.lock().push_back(doc);
            Ok(())
        }
    }

    async fn transmit(
        inner: &Arc<ClientInner>,
        doc: &SignalingDocument,
    ) -> Result<(), SignalingError> {
        let tx = inner
            .tx
            .read()
            .clone()
            .ok_or(SignalingError::NotConnected)?;

        let json =
            serde_json::to_string(doc).map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        tx.send(Message::Text(json))
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    async fn flush_pending(inner: &Arc<ClientInner>) {
        let docs: Vec<SignalingDocument> = {
            let mut pending = inner.pending.lock();
            pending.drain(..).collect()
        };

        if docs.is_empty() {
            return;
        }

        tracing::info!("Flushing {} queued documents", docs.len());
        for doc in docs {
            if let Err(e) = Self::transmit(inner, &doc).await {
                tracing::warn!("Failed to flush queued document: {}", e);
            }
        }
    }

    // ========================================================================
    // CONNECTION LIFECYCLE
    // ========================================================================

    /// Baut Transport und Handshake auf; gemeinsamer Pfad für Connect
    /// und Reconnect
    async fn establish(inner: &Arc<ClientInner>) -> Result<Session, SignalingError> {
        let ws_url = format!("{}/ws", inner.config.server_url.replace("http", "ws"));
        tracing::info!("Connecting to signaling relay: {}", ws_url);

        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<Message>(100);
        *inner.tx.write() = Some(tx.clone());

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        // Warteposten für das Self-Dokument
        let (self_tx, self_rx) = oneshot::channel();
        *inner.self_waiter.lock() = Some(self_tx);

        // Read-Task
        let inner_clone = Arc::clone(inner);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        Self::handle_text(&inner_clone, &text).await;
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        let _ = inner_clone.event_tx.send(SignalingEvent::Error {
                            message: e.to_string(),
                        });
                        break;
                    }
                    _ => {}
                }
            }
            Self::on_transport_closed(&inner_clone);
        });

        // Hello senden
        let display_name = inner.state.read().display_name.clone();
        let hello = SignalingDocument::Hello {
            hello: HelloPayload {
                version: PROTOCOL_VERSION.to_string(),
                ua: inner.config.user_agent.clone(),
                id: None,
                name: display_name,
            },
        };
        Self::transmit(inner, &hello).await?;

        // Auf Self warten (begrenzt)
        let session = match tokio::time::timeout(inner.config.handshake_timeout, self_rx).await {
            Ok(Ok(session)) => session,
            Ok(Err(_)) => {
                return Err(SignalingError::HandshakeFailed(
                    "connection closed during handshake".to_string(),
                ));
            }
            Err(_) => {
                // Halb offene Verbindung nicht stehen lassen
                let _ = tx.send(Message::Close(None)).await;
                return Err(SignalingError::HandshakeFailed(
                    "timeout waiting for Self".to_string(),
                ));
            }
        };

        Self::start_keepalive(inner, tx);
        Ok(session)
    }

    /// Startet den Keepalive-Task für genau diese Verbindung
    ///
    /// Der Task endet, sobald der Write-Task der Verbindung weg ist.
    fn start_keepalive(inner: &Arc<ClientInner>, tx: mpsc::Sender<Message>) {
        let interval = inner.config.keepalive_interval;
        tokio::spawn(async move {
            let alive = SignalingDocument::Alive {
                alive: AlivePayload::default(),
            };
            let json = match serde_json::to_string(&alive) {
                Ok(json) => json,
                Err(_) => return,
            };

            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // erster Tick feuert sofort
            loop {
                ticker.tick().await;
                if tx.send(Message::Text(json.clone())).await.is_err() {
                    break;
                }
            }
        });
    }

    /// Transport ist weg: Zustand zurücksetzen, ggf. Reconnect planen
    fn on_transport_closed(inner: &Arc<ClientInner>) {
        let (was_connected, intentional) = {
            let mut state = inner.state.write();
            let was_connected = state.connected;
            state.connected = false;
            state.session = None;
            state.room = None;
            (was_connected, state.intentional_close)
        };
        *inner.tx.write() = None;
        // Ein wartender Handshake schlägt damit fehl
        inner.self_waiter.lock().take();

        let _ = inner.event_tx.send(SignalingEvent::Disconnected);

        if was_connected && !intentional {
            Self::spawn_reconnect(inner);
        }
    }

    /// Plant Reconnect-Versuche mit exponentiellem Backoff
    fn spawn_reconnect(inner: &Arc<ClientInner>) {
        {
            let mut state = inner.state.write();
            if state.reconnecting {
                return;
            }
            state.reconnecting = true;
        }

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let max_attempts = inner.config.reconnect_max_attempts;
            for attempt in 1..=max_attempts {
                let delay = reconnect_delay(inner.config.reconnect_base_delay, attempt);
                tracing::info!(
                    "Reconnect attempt {}/{} in {:?}",
                    attempt,
                    max_attempts,
                    delay
                );
                tokio::time::sleep(delay).await;

                if inner.state.read().intentional_close {
                    inner.state.write().reconnecting = false;
                    return;
                }

                match Self::establish(&inner).await {
                    Ok(session) => {
                        inner.state.write().reconnecting = false;
                        let _ = inner.event_tx.send(SignalingEvent::Reconnected(session));
                        return;
                    }
                    Err(e) => {
                        tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
                    }
                }
            }

            inner.state.write().reconnecting = false;
            tracing::error!("All reconnect attempts exhausted");
            let _ = inner.event_tx.send(SignalingEvent::ReconnectFailed);
        });
    }

    // ========================================================================
    // INBOUND
    // ========================================================================

    /// Verarbeitet einen eingehenden Text-Frame
    ///
    /// Fehlerhafte Payloads werden geloggt und verworfen.
    async fn handle_text(inner: &Arc<ClientInner>, text: &str) {
        let (from, from_name, doc) = match serde_json::from_str::<Envelope>(text) {
            Ok(env) => (env.from, env.from_name, env.data),
            Err(_) => match serde_json::from_str::<SignalingDocument>(text) {
                Ok(doc) => (String::new(), None, doc),
                Err(e) => {
                    tracing::warn!("Dropping malformed document: {}", e);
                    return;
                }
            },
        };

        Self::handle_document(inner, from, from_name, doc).await;
    }

    async fn handle_document(
        inner: &Arc<ClientInner>,
        from: String,
        from_name: Option<String>,
        doc: SignalingDocument,
    ) {
        match doc {
            SignalingDocument::SelfDocument {
                id,
                sid,
                token,
                turn,
                stun,
            } => {
                let session = Session {
                    id: id.clone(),
                    sid,
                    token,
                    stun: stun.unwrap_or_default(),
                    turn: turn.map(|t| TurnCredentials {
                        username: t.username,
                        password: t.password,
                        ttl: Duration::from_secs(t.ttl),
                        urls: t.urls,
                        issued_at: Utc::now(),
                    }),
                };

                tracing::info!("Session established as {}", id);
                {
                    let mut state = inner.state.write();
                    state.connected = true;
                    state.session = Some(session.clone());
                }

                Self::flush_pending(inner).await;

                if let Some(waiter) = inner.self_waiter.lock().take() {
                    let _ = waiter.send(session);
                }
            }

            SignalingDocument::Offer { offer } => {
                let _ = inner.event_tx.send(SignalingEvent::Offer {
                    from,
                    from_name,
                    sdp: offer.sdp,
                    room: offer.room,
                });
            }

            SignalingDocument::Answer { answer } => {
                let _ = inner.event_tx.send(SignalingEvent::Answer {
                    from,
                    sdp: answer.sdp,
                });
            }

            SignalingDocument::Candidate { candidate } => {
                let _ = inner.event_tx.send(SignalingEvent::Candidate {
                    from,
                    candidate: candidate.init,
                });
            }

            SignalingDocument::Bye { bye } => {
                let _ = inner.event_tx.send(SignalingEvent::Bye {
                    from,
                    reason: bye.reason,
                });
            }

            SignalingDocument::Joined { joined } => {
                let _ = inner.event_tx.send(SignalingEvent::Joined {
                    id: joined.id,
                    name: joined.name,
                    room: joined.room,
                });
            }

            SignalingDocument::Left { left } => {
                let _ = inner.event_tx.send(SignalingEvent::Left {
                    id: left.id,
                    room: left.room,
                });
            }

            SignalingDocument::Users { users } => {
                let _ = inner.event_tx.send(SignalingEvent::Users(users));
            }

            SignalingDocument::Status { status } => {
                let _ = inner.event_tx.send(SignalingEvent::Status {
                    from,
                    name: status.name,
                });
            }

            SignalingDocument::Alive { .. } => {
                // Keepalive-Echo - nichts zu tun
            }

            other => {
                tracing::warn!("Dropping unexpected inbound document: {:?}", other);
            }
        }
    }
}

// ============================================================================
// TRANSPORT IMPL
// ============================================================================

#[async_trait]
impl SignalingTransport for SignalingClient {
    fn local_id(&self) -> Option<String> {
        self.inner.state.read().session.as_ref().map(|s| s.id.clone())
    }

    fn ice_servers(&self) -> Vec<IceServerConfig> {
        let state = self.inner.state.read();

        let mut servers: Vec<IceServerConfig> = Vec::new();

        let stun_urls: Vec<String> = self
            .inner
            .config
            .stun_servers
            .iter()
            .chain(state.session.iter().flat_map(|s| s.stun.iter()))
            .filter(|u| !u.is_empty())
            .cloned()
            .collect();
        if !stun_urls.is_empty() {
            servers.push(IceServerConfig {
                urls: stun_urls,
                username: None,
                credential: None,
            });
        }

        if let Some(turn) = state.session.as_ref().and_then(|s| s.turn.as_ref()) {
            let urls: Vec<String> = turn.urls.iter().filter(|u| !u.is_empty()).cloned().collect();
            if !urls.is_empty() && !turn.is_expired() {
                servers.push(IceServerConfig {
                    urls,
                    username: Some(turn.username.clone()),
                    credential: Some(turn.password.clone()),
                });
            }
        }

        servers
    }

    async fn join_room(&self, name: &str) -> Result<(), SignalingError> {
        SignalingClient::join_room(self, name).await
    }

    async fn leave_room(&self) -> Result<(), SignalingError> {
        SignalingClient::leave_room(self).await
    }

    async fn send_offer(
        &self,
        to: &str,
        sdp: String,
        room: Option<String>,
    ) -> Result<(), SignalingError> {
        self.send_or_queue(SignalingDocument::offer(to.to_string(), sdp, room))
            .await
    }

    async fn send_answer(&self, to: &str, sdp: String) -> Result<(), SignalingError> {
        self.send_or_queue(SignalingDocument::answer(to.to_string(), sdp))
            .await
    }

    async fn send_candidate(
        &self,
        to: &str,
        candidate: CandidateInit,
    ) -> Result<(), SignalingError> {
        self.send_or_queue(SignalingDocument::candidate(to.to_string(), candidate))
            .await
    }

    async fn send_bye(&self, to: &str, reason: Option<ByeReason>) -> Result<(), SignalingError> {
        self.send_or_queue(SignalingDocument::bye(to.to_string(), reason))
            .await
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.inner.config.server_url)
            .field("state", &*self.inner.state.read())
            .finish()
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn room_document(name: &str) -> SignalingDocument {
    SignalingDocument::Room {
        room: RoomPayload {
            name: name.to_string(),
            room_type: String::new(),
        },
    }
}

/// Verzögerung vor Versuch `attempt` (1-basiert): base * 2^(attempt-1)
pub(crate) fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    base * (1u32 << (attempt - 1).min(16))
}

// ============================================================================
// TESTS
// ============================================================================
