//! Message Types für das Relay-Protokoll
//!
//! Alle Nachrichten sind JSON-Objekte mit einem `type`-Feld. Der Relay
//! interpretiert nur `to`/`from` und leitet den Rest unverändert weiter.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Eindeutige ID eines Anrufversuchs (vom Initiator gewählt)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Erzeugt eine neue zufällige Session-ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// NEGOTIATION PAYLOADS
// ============================================================================

/// Art einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Opake Session Description (SDP-Äquivalent)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity Candidate im Format von `RTCIceCandidateInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl Candidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

// ============================================================================
// CLIENT → RELAY MESSAGES
// ============================================================================

/// Alle Nachrichten, die ein Endpoint an den Relay schickt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Präsenz anmelden
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },

    /// Einem Raum beitreten (Raum-Adressierung)
    JoinRoom { room_id: String },

    /// Anrufversuch starten
    Initiate { session_id: SessionId, to: String },

    /// Angerufener nimmt an
    Accept { session_id: SessionId, to: String },

    /// Angerufener lehnt ab
    Reject { session_id: SessionId, to: String },

    /// Anruf vor der Annahme abbrechen
    Cancel { session_id: SessionId, to: String },

    /// Laufenden Anruf beenden
    Hangup { session_id: SessionId, to: String },

    /// Angerufener ist besetzt
    Busy { session_id: SessionId, to: String },

    /// Offer oder Answer
    Description {
        session_id: SessionId,
        to: String,
        description: SessionDescription,
    },

    /// Connectivity Candidate
    Candidate {
        session_id: SessionId,
        to: String,
        candidate: Candidate,
    },

    /// Keep-Alive
    Heartbeat,
}

impl ClientMessage {
    /// Wire-Name für Logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::JoinRoom { .. } => "join_room",
            Self::Initiate { .. } => "initiate",
            Self::Accept { .. } => "accept",
            Self::Reject { .. } => "reject",
            Self::Cancel { .. } => "cancel",
            Self::Hangup { .. } => "hangup",
            Self::Busy { .. } => "busy",
            Self::Description { .. } => "description",
            Self::Candidate { .. } => "candidate",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Session, auf die sich die Nachricht bezieht
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Initiate { session_id, .. }
            | Self::Accept { session_id, .. }
            | Self::Reject { session_id, .. }
            | Self::Cancel { session_id, .. }
            | Self::Hangup { session_id, .. }
            | Self::Busy { session_id, .. }
            | Self::Description { session_id, .. }
            | Self::Candidate { session_id, .. } => Some(session_id),
            Self::Register { .. } | Self::JoinRoom { .. } | Self::Heartbeat => None,
        }
    }
}

// ============================================================================
// RELAY → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Relay-Nachrichten
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RelayMessage {
    /// Registrierung bestätigt
    Registered { endpoint_id: String },

    /// Raum betreten
    JoinedRoom { room_id: String },

    /// Raum ist bereits mit zwei Teilnehmern belegt
    RoomFull { room_id: String },

    /// Ein zweiter Teilnehmer ist dem Raum beigetreten; der Empfänger wird Initiator
    PeerJoined { peer_id: String },

    /// Der Relay hat ein `initiate` an das Ziel zugestellt
    Delivered { session_id: SessionId, to: String },

    /// Eingehender Anruf
    Initiate { session_id: SessionId, from: String },

    /// Anruf angenommen
    Accept { session_id: SessionId, from: String },

    /// Anruf abgelehnt
    Reject { session_id: SessionId, from: String },

    /// Anruf abgebrochen
    Cancel { session_id: SessionId, from: String },

    /// Anruf beendet
    Hangup { session_id: SessionId, from: String },

    /// Gegenseite besetzt
    Busy { session_id: SessionId, from: String },

    /// Offer oder Answer der Gegenseite
    Description {
        session_id: SessionId,
        from: String,
        description: SessionDescription,
    },

    /// Candidate der Gegenseite
    Candidate {
        session_id: SessionId,
        from: String,
        candidate: Candidate,
    },

    /// Gegenseite hat die Verbindung zum Relay verloren
    PeerLeft {
        peer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },

    /// Fehler
    Error { code: i32, message: String },

    /// Heartbeat Antwort
    Pong,
}

impl RelayMessage {
    /// Wire-Name für Logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::JoinedRoom { .. } => "joined_room",
            Self::RoomFull { .. } => "room_full",
            Self::PeerJoined { .. } => "peer_joined",
            Self::Delivered { .. } => "delivered",
            Self::Initiate { .. } => "initiate",
            Self::Accept { .. } => "accept",
            Self::Reject { .. } => "reject",
            Self::Cancel { .. } => "cancel",
            Self::Hangup { .. } => "hangup",
            Self::Busy { .. } => "busy",
            Self::Description { .. } => "description",
            Self::Candidate { .. } => "candidate",
            Self::PeerLeft { .. } => "peer_left",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_shape() {
        let msg = ClientMessage::Initiate {
            session_id: SessionId::from("s-1"),
            to: "bob".to_string(),
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "type": "initiate", "sessionId": "s-1", "to": "bob" })
        );
    }

    #[test]
    fn test_candidate_uses_browser_field_names() {
        let msg = ClientMessage::Candidate {
            session_id: SessionId::from("s-1"),
            to: "bob".to_string(),
            candidate: Candidate {
                candidate: "candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["candidate"]["sdpMid"], "0");
        assert_eq!(json["candidate"]["sdpMLineIndex"], 0);
        assert!(json["candidate"].get("usernameFragment").is_none());
    }

    #[test]
    fn test_parse_relay_description() {
        let raw = r#"{
            "type": "description",
            "sessionId": "s-9",
            "from": "alice",
            "description": { "type": "offer", "sdp": "v=0" },
            "timestamp": 1700000000000
        }"#;

        let msg: RelayMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg,
            RelayMessage::Description {
                session_id: SessionId::from("s-9"),
                from: "alice".to_string(),
                description: SessionDescription::offer("v=0"),
            }
        );
    }

    #[test]
    fn test_parse_peer_left_without_session() {
        let msg: RelayMessage =
            serde_json::from_str(r#"{ "type": "peer_left", "peerId": "bob" }"#).unwrap();
        assert_eq!(
            msg,
            RelayMessage::PeerLeft {
                peer_id: "bob".to_string(),
                session_id: None,
            }
        );
        assert_eq!(msg.kind(), "peer_left");
    }

    #[test]
    fn test_generated_session_ids_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }
}
