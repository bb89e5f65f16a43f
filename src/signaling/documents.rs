//! Wire-Dokumente für das Signaling-Protokoll
//!
//! Geschlossene, getaggte Menge von JSON-Dokumenten, die zwischen
//! Client und Rendezvous-Relay ausgetauscht werden. Die Feldnamen
//! entsprechen exakt dem Wire-Format (großgeschriebene Keys).

use serde::{Deserialize, Serialize};

// ============================================================================
// BYE REASON
// ============================================================================

/// Grund für ein Bye-Dokument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByeReason {
    Busy,
    Reject,
    Pickuptimeout,
    Abort,
}

impl std::fmt::Display for ByeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ByeReason::Busy => write!(f, "busy"),
            ByeReason::Reject => write!(f, "reject"),
            ByeReason::Pickuptimeout => write!(f, "pickuptimeout"),
            ByeReason::Abort => write!(f, "abort"),
        }
    }
}

// ============================================================================
// PAYLOADS
// ============================================================================

/// Handshake-Begrüßung des Clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Ua")]
    pub ua: String,
    #[serde(rename = "Id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "Name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// TURN-Credentials aus dem Self-Dokument (Keys klein, wie vom Relay geprägt)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnPayload {
    pub username: String,
    pub password: String,
    /// Gültigkeitsdauer in Sekunden
    pub ttl: u64,
    pub urls: Vec<String>,
}

/// Raum beitreten; leerer Name verlässt den aktuellen Raum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomPayload {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Type", default)]
    pub room_type: String,
}

/// SDP Offer; `room` transportiert den Raum-Namen der Einladung
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferPayload {
    #[serde(rename = "Type")]
    pub sdp_type: String,
    #[serde(rename = "Sdp")]
    pub sdp: String,
    #[serde(rename = "To")]
    pub to: String,
    #[serde(rename = "Room", skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

/// SDP Answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerPayload {
    #[serde(rename = "Type")]
    pub sdp_type: String,
    #[serde(rename = "Sdp")]
    pub sdp: String,
    #[serde(rename = "To")]
    pub to: String,
}

/// ICE Candidate ohne Adressierung (API-Seite)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateInit {
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    pub candidate: String,
}

/// ICE Candidate auf dem Wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePayload {
    #[serde(flatten)]
    pub init: CandidateInit,
    #[serde(rename = "To")]
    pub to: String,
}

/// Anruf beenden/ablehnen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ByePayload {
    #[serde(rename = "To")]
    pub to: String,
    #[serde(rename = "Reason", skip_serializing_if = "Option::is_none")]
    pub reason: Option<ByeReason>,
}

/// Selbst-Update des Display-Namens; mit `To` gezielt zustellbar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "To", skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

/// Präsenz: Endpoint ist einem Raum beigetreten
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedPayload {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Room", default)]
    pub room: String,
}

/// Präsenz: Endpoint hat Raum/Verbindung verlassen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeftPayload {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Room", default)]
    pub room: String,
}

/// Eintrag in der Raum-Teilnehmerliste
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEntry {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
}

/// Keepalive (leerer Inhalt)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlivePayload {}

// ============================================================================
// DOCUMENT
// ============================================================================

/// Alle Dokument-Arten des Protokolls
///
/// Jedes Dokument außer Hello/Self/Alive trägt eine Ziel-Endpoint-Id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum SignalingDocument {
    Hello {
        #[serde(rename = "Hello")]
        hello: HelloPayload,
    },

    /// Handshake-Ergebnis: Identität und ICE-Server des Clients
    #[serde(rename = "Self")]
    SelfDocument {
        #[serde(rename = "Id")]
        id: String,
        #[serde(rename = "Sid")]
        sid: String,
        #[serde(rename = "Token")]
        token: String,
        #[serde(rename = "Turn", skip_serializing_if = "Option::is_none")]
        turn: Option<TurnPayload>,
        #[serde(rename = "Stun", skip_serializing_if = "Option::is_none")]
        stun: Option<Vec<String>>,
    },

    Room {
        #[serde(rename = "Room")]
        room: RoomPayload,
    },

    Offer {
        #[serde(rename = "Offer")]
        offer: OfferPayload,
    },

    Answer {
        #[serde(rename = "Answer")]
        answer: AnswerPayload,
    },

    Candidate {
        #[serde(rename = "Candidate")]
        candidate: CandidatePayload,
    },

    Bye {
        #[serde(rename = "Bye")]
        bye: ByePayload,
    },

    Status {
        #[serde(rename = "Status")]
        status: StatusPayload,
    },

    Joined {
        #[serde(rename = "Joined")]
        joined: JoinedPayload,
    },

    Left {
        #[serde(rename = "Left")]
        left: LeftPayload,
    },

    Users {
        #[serde(rename = "Users")]
        users: Vec<UserEntry>,
    },

    Alive {
        #[serde(rename = "Alive")]
        alive: AlivePayload,
    },
}

impl SignalingDocument {
    /// Erstellt ein Offer-Dokument
    pub fn offer(to: String, sdp: String, room: Option<String>) -> Self {
        SignalingDocument::Offer {
            offer: OfferPayload {
                sdp_type: "offer".to_string(),
                sdp,
                to,
                room,
            },
        }
    }

    /// Erstellt ein Answer-Dokument
    pub fn answer(to: String, sdp: String) -> Self {
        SignalingDocument::Answer {
            answer: AnswerPayload {
                sdp_type: "answer".to_string(),
                sdp,
                to,
            },
        }
    }

    /// Erstellt ein Candidate-Dokument
    pub fn candidate(to: String, init: CandidateInit) -> Self {
        SignalingDocument::Candidate {
            candidate: CandidatePayload { init, to },
        }
    }

    /// Erstellt ein Bye-Dokument
    pub fn bye(to: String, reason: Option<ByeReason>) -> Self {
        SignalingDocument::Bye {
            bye: ByePayload { to, reason },
        }
    }

    /// Ziel-Endpoint-Id des Dokuments, falls adressiert
    pub fn to(&self) -> Option<&str> {
        match self {
            SignalingDocument::Offer { offer } => Some(&offer.to),
            SignalingDocument::Answer { answer } => Some(&answer.to),
            SignalingDocument::Candidate { candidate } => Some(&candidate.to),
            SignalingDocument::Bye { bye } => Some(&bye.to),
            SignalingDocument::Status { status } => status.to.as_deref(),
            _ => None,
        }
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// Relay-Hülle um zugestellte Dokumente
///
/// `from` ist leer für Dokumente, die das Relay selbst erzeugt;
/// `from_name` ist der Display-Name des Absenders laut Hello.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "From", default)]
    pub from: String,
    #[serde(rename = "Name", default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    #[serde(rename = "Data")]
    pub data: SignalingDocument,
}

/// Prüft, ob ein Offer-SDP einen Video-Abschnitt enthält
pub fn sdp_wants_video(sdp: &str) -> bool {
    sdp.lines().any(|l| l.starts_with("m=video"))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_wire_shape() {
        let doc = SignalingDocument::Hello {
            hello: HelloPayload {
                version: "1.0".to_string(),
                ua: "funkruf/0.1".to_string(),
                id: None,
                name: Some("alice".to_string()),
            },
        };

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["Type"], "Hello");
        assert_eq!(value["Hello"]["Version"], "1.0");
        assert_eq!(value["Hello"]["Name"], "alice");
        // Id ist None und darf nicht serialisiert werden
        assert!(value["Hello"].get("Id").is_none());
    }

    #[test]
    fn test_self_document_roundtrip() {
        let json = r#"{
            "Type": "Self",
            "Id": "ep-1",
            "Sid": "sid-1",
            "Token": "tok-1",
            "Turn": {
                "username": "u",
                "password": "p",
                "ttl": 3600,
                "urls": ["turn:turn.example.org:3478"]
            },
            "Stun": ["stun:stun.example.org:3478"]
        }"#;

        let doc: SignalingDocument = serde_json::from_str(json).unwrap();
        match &doc {
            SignalingDocument::SelfDocument {
                id, turn, stun, ..
            } => {
                assert_eq!(id, "ep-1");
                assert_eq!(turn.as_ref().unwrap().ttl, 3600);
                assert_eq!(stun.as_ref().unwrap().len(), 1);
            }
            other => panic!("unexpected document: {other:?}"),
        }

        // Tag bleibt beim Zurückschreiben erhalten
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["Type"], "Self");
        assert_eq!(value["Sid"], "sid-1");
    }

    #[test]
    fn test_candidate_wire_keys() {
        let doc = SignalingDocument::candidate(
            "bob".to_string(),
            CandidateInit {
                sdp_mline_index: Some(0),
                sdp_mid: Some("0".to_string()),
                candidate: "candidate:1 1 udp 2122252543 192.168.1.10 54321 typ host".to_string(),
            },
        );

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["Type"], "Candidate");
        assert_eq!(value["Candidate"]["sdpMLineIndex"], 0);
        assert_eq!(value["Candidate"]["sdpMid"], "0");
        assert_eq!(value["Candidate"]["To"], "bob");
        assert!(value["Candidate"]["candidate"]
            .as_str()
            .unwrap()
            .starts_with("candidate:"));
    }

    #[test]
    fn test_bye_reason_codes() {
        for (reason, wire) in [
            (ByeReason::Busy, "busy"),
            (ByeReason::Reject, "reject"),
            (ByeReason::Pickuptimeout, "pickuptimeout"),
            (ByeReason::Abort, "abort"),
        ] {
            let doc = SignalingDocument::bye("bob".to_string(), Some(reason));
            let value = serde_json::to_value(&doc).unwrap();
            assert_eq!(value["Bye"]["Reason"], wire);

            let back: SignalingDocument = serde_json::from_value(value).unwrap();
            match back {
                SignalingDocument::Bye { bye } => assert_eq!(bye.reason, Some(reason)),
                other => panic!("unexpected document: {other:?}"),
            }
        }
    }

    #[test]
    fn test_envelope_unwrap() {
        let json = r#"{
            "From": "alice",
            "Name": "Alice",
            "Data": { "Type": "Bye", "Bye": { "To": "bob", "Reason": "busy" } }
        }"#;

        let env: Envelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.from, "alice");
        assert_eq!(env.from_name.as_deref(), Some("Alice"));
        assert_eq!(env.data.to(), Some("bob"));
    }

    #[test]
    fn test_malformed_document_is_error() {
        assert!(serde_json::from_str::<SignalingDocument>("not json").is_err());
        assert!(serde_json::from_str::<SignalingDocument>(r#"{"Type":"Nonsense"}"#).is_err());
        // Offer ohne Pflichtfelder
        assert!(serde_json::from_str::<SignalingDocument>(r#"{"Type":"Offer","Offer":{}}"#).is_err());
    }

    #[test]
    fn test_sdp_wants_video() {
        let audio_only = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";
        let with_video = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";
        assert!(!sdp_wants_video(audio_only));
        assert!(sdp_wants_video(with_video));
    }
}
