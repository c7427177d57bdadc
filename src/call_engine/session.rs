//! Call Session - Zustand eines einzelnen Anrufversuchs

use super::media::MediaTrack;
use crate::signaling::{Candidate, SessionId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

// ============================================================================
// CALL STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

/// Warum ein Anruf beendet wurde
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Rejected,
    Busy,
    Cancelled,
    TimedOut,
    PeerLeft,
    LocalHangup,
    RemoteHangup,
    ConnectionLost,
    MediaDenied,
    NegotiationFailed,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Rejected => "Call was rejected",
            Self::Busy => "Peer is busy",
            Self::Cancelled => "Call was cancelled",
            Self::TimedOut => "No answer",
            Self::PeerLeft => "Peer left",
            Self::LocalHangup => "Call ended",
            Self::RemoteHangup => "Peer hung up",
            Self::ConnectionLost => "Connection lost",
            Self::MediaDenied => "Could not access camera/mic",
            Self::NegotiationFailed => "Call setup failed",
        };
        f.write_str(text)
    }
}

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum CallState {
    /// Kein aktiver Anruf
    Idle,
    /// Ausgehender Anruf klingelt
    RingingOut,
    /// Eingehender Anruf wartet auf Antwort
    RingingIn,
    /// Offer/Answer und Connectivity laufen
    Negotiating,
    /// Medien fließen
    Connected,
    /// Terminal
    Ended(EndReason),
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended(_))
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::RingingOut | Self::RingingIn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    RingTimeout,
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Ein Anrufversuch vom Initiieren bis zum Ende
///
/// Negotiator, Timer und Medien werden vom Controller gehalten; die Session
/// führt Buch darüber, welche davon gerade belegt sind, damit beim Ende jede
/// Ressource genau einmal freigegeben wird.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub(crate) id: SessionId,
    pub(crate) role: Role,
    pub(crate) peer: Option<String>,
    pub(crate) state: CallState,
    pub(crate) pending_remote_candidates: Vec<Candidate>,
    pub(crate) remote_description_set: bool,
    pub(crate) local_tracks: Vec<MediaTrack>,
    pub(crate) media_acquired: bool,
    pub(crate) negotiator_open: bool,
    /// Die Gegenseite kennt die Session (initiate gesendet bzw. empfangen)
    pub(crate) peer_aware: bool,
    pub(crate) push_dispatched: bool,
    pub(crate) timers: BTreeSet<TimerKind>,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    pub(crate) fn outgoing(peer: Option<String>) -> Self {
        Self::new(SessionId::generate(), Role::Initiator, peer, CallState::RingingOut)
    }

    pub(crate) fn incoming(id: SessionId, peer: String) -> Self {
        let mut session = Self::new(id, Role::Responder, Some(peer), CallState::RingingIn);
        session.peer_aware = true;
        session
    }

    fn new(id: SessionId, role: Role, peer: Option<String>, state: CallState) -> Self {
        Self {
            id,
            role,
            peer,
            state,
            pending_remote_candidates: Vec::new(),
            remote_description_set: false,
            local_tracks: Vec::new(),
            media_acquired: false,
            negotiator_open: false,
            peer_aware: false,
            push_dispatched: false,
            timers: BTreeSet::new(),
            started_at: Utc::now(),
            connected_at: None,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        match self.state {
            CallState::Ended(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn pending_candidates(&self) -> &[Candidate] {
        &self.pending_remote_candidates
    }

    /// Gesprächsdauer ab `Connected`
    pub fn duration(&self) -> Option<std::time::Duration> {
        self.connected_at
            .and_then(|at| (Utc::now() - at).to_std().ok())
    }
}
