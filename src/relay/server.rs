//! Rendezvous-Relay
//!
//! Stateless-per-Message-Router zwischen registrierten Endpoints:
//! - Hello/Self-Handshake bindet eine Live-Verbindung an eine
//!   Endpoint-Id (last write wins)
//! - Adressierte Dokumente werden wörtlich in einer Envelope
//!   weitergereicht
//! - Offer an einen Endpoint ohne Verbindung weckt den
//!   Push-Kollaborateur, alles andere wird still verworfen
//! - Raum-Tabelle mit maximal zwei Mitgliedern, Joined/Left-Präsenz
//!
//! Es gibt keine Persistenz über die In-Memory-Maps hinaus.

use super::push::PushNotifier;
use crate::call::CallKind;
use crate::config::RelayConfig;
use crate::signaling::{
    sdp_wants_video, Envelope, JoinedPayload, LeftPayload, SignalingDocument, TurnPayload,
    UserEntry,
};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use uuid::Uuid;

/// Raumgröße: genau die zwei Parteien eines Anrufs
const ROOM_CAPACITY: usize = 2;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("Endpoint did not register in time")]
    RegistrationTimeout,
}

// ============================================================================
// ENDPOINT MAP
// ============================================================================

struct Endpoint {
    /// Verbindungs-Id; schützt beim Unbind vor dem Löschen einer
    /// neueren Registrierung derselben Endpoint-Id
    sid: String,
    name: String,
    tx: mpsc::UnboundedSender<Message>,
}

// ============================================================================
// RELAY
// ============================================================================

/// Das Rendezvous-Relay
pub struct Relay {
    config: RelayConfig,
    push: Arc<dyn PushNotifier>,
    endpoints: DashMap<String, Endpoint>,
    rooms: DashMap<String, Vec<String>>,
}

impl Relay {
    pub fn new(config: RelayConfig, push: Arc<dyn PushNotifier>) -> Arc<Self> {
        Arc::new(Self {
            config,
            push,
            endpoints: DashMap::new(),
            rooms: DashMap::new(),
        })
    }

    /// Anzahl aktuell gebundener Endpoints
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Accept-Loop; läuft bis der Listener stirbt
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        tracing::info!(
            "Relay listening on {}",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default()
        );

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let relay = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = relay.handle_connection(stream, addr).await {
                            tracing::debug!("Connection {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept failed: {}", e);
                }
            }
        }
    }

    // ========================================================================
    // CONNECTION LIFECYCLE
    // ========================================================================

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), RelayError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| RelayError::Handshake(e.to_string()))?;
        tracing::debug!("WebSocket connection from {}", addr);

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // Registrierung: das erste brauchbare Dokument muss Hello sein
        let hello = tokio::time::timeout(self.config.handshake_timeout, async {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<SignalingDocument>(&text) {
                            Ok(SignalingDocument::Hello { hello }) => return Some(hello),
                            Ok(other) => {
                                tracing::warn!("Expected Hello, got {:?}", other);
                            }
                            Err(e) => {
                                tracing::warn!("Dropping malformed document: {}", e);
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => return None,
                    _ => {}
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
        .ok_or(RelayError::RegistrationTimeout)?;

        let id = hello
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let sid = Uuid::new_v4().to_string();
        let name = hello.name.unwrap_or_else(|| id.clone());

        self.register(&id, &sid, &name, tx.clone());
        self.deliver_raw(&tx, "", None, self.self_document(&id, &sid));
        tracing::info!("Endpoint {} registered ({})", id, name);

        // Read-Loop
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => self.handle_text(&id, &text),
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::debug!("WebSocket error from {}: {}", id, e);
                    break;
                }
                _ => {}
            }
        }

        self.unregister(&id, &sid);
        Ok(())
    }

    /// Bindet eine Live-Verbindung an die Endpoint-Id; last write wins
    fn register(&self, id: &str, sid: &str, name: &str, tx: mpsc::UnboundedSender<Message>) {
        let previous = self.endpoints.insert(
            id.to_string(),
            Endpoint {
                sid: sid.to_string(),
                name: name.to_string(),
                tx,
            },
        );
        if previous.is_some() {
            tracing::info!("Endpoint {} re-registered, superseding old connection", id);
        }
    }

    /// Löst die Bindung und verteilt die Präsenz-Abmeldung
    fn unregister(&self, id: &str, sid: &str) {
        // Nur die eigene Bindung entfernen; eine neuere Registrierung
        // derselben Id bleibt bestehen
        let removed = self
            .endpoints
            .remove_if(id, |_, endpoint| endpoint.sid == sid)
            .is_some();
        if !removed {
            return;
        }

        let room = self.leave_rooms(id);
        tracing::info!("Endpoint {} unbound", id);

        let left = SignalingDocument::Left {
            left: LeftPayload {
                id: id.to_string(),
                room: room.unwrap_or_default(),
            },
        };
        self.broadcast(id, left);
    }

    // ========================================================================
    // ROUTING
    // ========================================================================

    fn handle_text(&self, from: &str, text: &str) {
        let doc = match serde_json::from_str::<SignalingDocument>(text) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!("Dropping malformed document from {}: {}", from, e);
                return;
            }
        };

        match doc {
            SignalingDocument::Alive { alive } => {
                // Keepalive wird beantwortet, nicht geroutet
                if let Some(endpoint) = self.endpoints.get(from) {
                    self.deliver_raw(&endpoint.tx, "", None, SignalingDocument::Alive { alive });
                }
            }

            SignalingDocument::Room { room } => self.handle_room(from, &room.name),

            SignalingDocument::Status { status } => {
                if let Some(mut endpoint) = self.endpoints.get_mut(from) {
                    endpoint.name = status.name.clone();
                }
                let doc = SignalingDocument::Status { status };
                if doc.to().is_some() {
                    self.route(from, doc);
                } else {
                    self.broadcast_to_room(from, doc);
                }
            }

            doc if doc.to().is_some() => self.route(from, doc),

            other => {
                tracing::warn!("Dropping unroutable document from {}: {:?}", from, other);
            }
        }
    }

    /// Stellt ein adressiertes Dokument zu
    ///
    /// Ist das Ziel nicht gebunden, weckt ein Offer den
    /// Push-Kollaborateur; alle anderen Arten werden still ignoriert.
    fn route(&self, from: &str, doc: SignalingDocument) {
        let to = match doc.to() {
            Some(to) => to.to_string(),
            None => return,
        };
        let from_name = self.endpoints.get(from).map(|e| e.name.clone());

        if let Some(endpoint) = self.endpoints.get(&to) {
            self.deliver_raw(&endpoint.tx, from, from_name, doc);
            return;
        }

        if let SignalingDocument::Offer { offer } = &doc {
            let kind = if sdp_wants_video(&offer.sdp) {
                CallKind::Video
            } else {
                CallKind::Audio
            };
            let caller_name = from_name.unwrap_or_else(|| from.to_string());
            tracing::info!(
                "Endpoint {} offline, waking via push ({:?} call from {})",
                to,
                kind,
                caller_name
            );

            // Fire-and-forget; das Offer selbst wird nicht zugestellt
            let push = Arc::clone(&self.push);
            tokio::spawn(async move {
                push.notify_incoming_call(&to, &caller_name, kind).await;
            });
        } else {
            tracing::debug!("Dropping document for unbound endpoint {}", to);
        }
    }

    // ========================================================================
    // ROOMS
    // ========================================================================

    /// Raum-Wechsel; leerer Name bedeutet nur verlassen
    fn handle_room(&self, from: &str, name: &str) {
        if let Some(previous) = self.leave_rooms(from) {
            tracing::debug!("Endpoint {} left room {}", from, previous);
        }
        if name.is_empty() {
            return;
        }

        {
            let mut members = self.rooms.entry(name.to_string()).or_default();
            if members.len() >= ROOM_CAPACITY {
                tracing::warn!("Room {} is full, rejecting {}", name, from);
                return;
            }
            members.push(from.to_string());
        }
        tracing::debug!("Endpoint {} joined room {}", from, name);

        let from_name = self
            .endpoints
            .get(from)
            .map(|e| e.name.clone())
            .unwrap_or_default();

        // Beide Seiten sehen den Beitritt, der Beitretende die Liste
        let mut roster = Vec::new();
        for member in self.room_members(name) {
            let member_name = self
                .endpoints
                .get(&member)
                .map(|e| e.name.clone())
                .unwrap_or_default();
            roster.push(UserEntry {
                id: member.clone(),
                name: member_name.clone(),
            });

            if member != from {
                self.deliver_to(
                    &member,
                    "",
                    None,
                    SignalingDocument::Joined {
                        joined: JoinedPayload {
                            id: from.to_string(),
                            name: from_name.clone(),
                            room: name.to_string(),
                        },
                    },
                );
                self.deliver_to(
                    from,
                    "",
                    None,
                    SignalingDocument::Joined {
                        joined: JoinedPayload {
                            id: member.clone(),
                            name: member_name,
                            room: name.to_string(),
                        },
                    },
                );
            }
        }
        self.deliver_to(from, "", None, SignalingDocument::Users { users: roster });
    }

    /// Entfernt den Endpoint aus seinem Raum und informiert den
    /// verbleibenden Teilnehmer; liefert den verlassenen Raum
    fn leave_rooms(&self, id: &str) -> Option<String> {
        let mut left_room = None;
        self.rooms.retain(|room, members| {
            if let Some(pos) = members.iter().position(|m| m == id) {
                members.remove(pos);
                left_room = Some(room.clone());
                for member in members.iter() {
                    self.deliver_to(
                        member,
                        "",
                        None,
                        SignalingDocument::Left {
                            left: LeftPayload {
                                id: id.to_string(),
                                room: room.clone(),
                            },
                        },
                    );
                }
            }
            !members.is_empty()
        });
        left_room
    }

    fn room_members(&self, name: &str) -> Vec<String> {
        self.rooms
            .get(name)
            .map(|members| members.clone())
            .unwrap_or_default()
    }

    fn broadcast_to_room(&self, from: &str, doc: SignalingDocument) {
        let room = self.rooms.iter().find_map(|entry| {
            entry
                .value()
                .iter()
                .any(|m| m == from)
                .then(|| entry.key().clone())
        });
        let Some(room) = room else { return };

        let from_name = self.endpoints.get(from).map(|e| e.name.clone());
        for member in self.room_members(&room) {
            if member != from {
                self.deliver_to(&member, from, from_name.clone(), doc.clone());
            }
        }
    }

    // ========================================================================
    // DELIVERY
    // ========================================================================

    fn self_document(&self, id: &str, sid: &str) -> SignalingDocument {
        SignalingDocument::SelfDocument {
            id: id.to_string(),
            sid: sid.to_string(),
            token: Uuid::new_v4().to_string(),
            turn: self.config.turn.as_ref().map(|t| TurnPayload {
                username: t.username.clone(),
                password: t.password.clone(),
                ttl: t.ttl_secs,
                urls: t.urls.clone(),
            }),
            stun: Some(self.config.stun_servers.clone()),
        }
    }

    fn deliver_to(&self, id: &str, from: &str, from_name: Option<String>, doc: SignalingDocument) {
        if let Some(endpoint) = self.endpoints.get(id) {
            self.deliver_raw(&endpoint.tx, from, from_name, doc);
        }
    }

    fn deliver_raw(
        &self,
        tx: &mpsc::UnboundedSender<Message>,
        from: &str,
        from_name: Option<String>,
        doc: SignalingDocument,
    ) {
        let envelope = Envelope {
            from: from.to_string(),
            from_name,
            data: doc,
        };
        match serde_json::to_string(&envelope) {
            Ok(json) => {
                if tx.send(Message::Text(json)).is_err() {
                    tracing::debug!("Dropping document for closed connection");
                }
            }
            Err(e) => tracing::error!("Failed to serialize envelope: {}", e),
        }
    }

    /// Sendet ein Relay-Dokument an alle gebundenen Endpoints außer `except`
    fn broadcast(&self, except: &str, doc: SignalingDocument) {
        for entry in self.endpoints.iter() {
            if entry.key() != except {
                self.deliver_raw(&entry.tx, "", None, doc.clone());
            }
        }
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("endpoints", &self.endpoints.len())
            .field("rooms", &self.rooms.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
