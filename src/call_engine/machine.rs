//! Call State Machine
//!
//! Synchroner Kern: jedes Ereignis (Benutzeraktion, Relay-Nachricht,
//! Negotiator-Ergebnis, Timer, Medienfreigabe) wird einzeln verarbeitet und
//! liefert eine Liste von [`Effect`]s, die der Controller ausführt.
//! Asynchrone Schritte melden sich als neues Ereignis zurück und werden gegen
//! die aktuelle Session geprüft, bevor sie angewendet werden.

use super::media::{MediaError, MediaKinds, MediaTrack};
use super::negotiator::{NegotiatorCommand, NegotiatorError, NegotiatorEvent, NegotiatorReport};
use super::push::PushError;
use super::session::{CallSession, CallState, EndReason, Role, TimerKind};
use super::transport::ConnectivityState;
use crate::config::{AddressingMode, Config};
use crate::signaling::{
    Candidate, ClientMessage, DescriptionKind, RelayError, RelayMessage, SessionDescription,
    SessionId,
};
use chrono::Utc;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum CallEngineError {
    #[error("No active call")]
    NoActiveCall,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Not possible while {0:?}")]
    InvalidState(CallState),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Call engine stopped")]
    Stopped,
}

// ============================================================================
// MACHINE CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct MachineConfig {
    pub media: MediaKinds,
    pub ring_timeout: Duration,
    pub addressing: AddressingMode,
    pub auto_answer: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for MachineConfig {
    fn from(config: &Config) -> Self {
        Self {
            media: config.media,
            ring_timeout: config.ring_timeout(),
            addressing: config.addressing,
            auto_answer: config.auto_answer,
        }
    }
}

// ============================================================================
// EVENTS, EFFECTS, NOTICES
// ============================================================================

/// Ereignisse, die nicht vom lokalen Benutzer stammen
#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent {
    Relay(RelayMessage),
    /// Verbindung zum Relay verloren (gilt als "Gegenseite weg")
    RelayDisconnected,
    /// Relay-Nachrichten sind lokal verloren gegangen
    RelayLagged { missed: u64 },
    MediaGranted {
        session_id: SessionId,
        tracks: Vec<MediaTrack>,
    },
    MediaDenied {
        session_id: SessionId,
        error: MediaError,
    },
    Negotiator(NegotiatorReport),
    TimerFired {
        session_id: SessionId,
        kind: TimerKind,
    },
    PushCompleted {
        session_id: SessionId,
        result: Result<(), PushError>,
    },
}

/// Was der Controller ausführen soll
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(ClientMessage),
    AcquireMedia {
        session_id: SessionId,
        kinds: MediaKinds,
    },
    ReleaseMedia {
        session_id: SessionId,
    },
    OpenNegotiator {
        session_id: SessionId,
    },
    Negotiate {
        session_id: SessionId,
        command: NegotiatorCommand,
    },
    CloseNegotiator {
        session_id: SessionId,
    },
    ArmTimer {
        session_id: SessionId,
        kind: TimerKind,
        after: Duration,
    },
    CancelTimer {
        session_id: SessionId,
        kind: TimerKind,
    },
    DispatchPush {
        session_id: SessionId,
        target: String,
    },
    Notify(CallNotice),
}

/// Benachrichtigungen für die Oberfläche
#[derive(Debug, Clone, PartialEq)]
pub enum CallNotice {
    IncomingCall {
        session_id: SessionId,
        from: String,
    },
    StateChanged {
        session_id: SessionId,
        state: CallState,
    },
    Connected {
        session_id: SessionId,
    },
    Ended {
        session_id: SessionId,
        reason: EndReason,
        duration: Option<Duration>,
    },
    PushFailed {
        session_id: SessionId,
        message: String,
    },
    RoomJoined {
        room_id: String,
    },
    RoomFull {
        room_id: String,
    },
    RelayError {
        code: i32,
        message: String,
    },
}

/// Steuer-Nachrichten an die Gegenseite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Accept,
    Reject,
    Cancel,
    Hangup,
}

impl Signal {
    fn message(self, session_id: SessionId, to: String) -> ClientMessage {
        match self {
            Self::Accept => ClientMessage::Accept { session_id, to },
            Self::Reject => ClientMessage::Reject { session_id, to },
            Self::Cancel => ClientMessage::Cancel { session_id, to },
            Self::Hangup => ClientMessage::Hangup { session_id, to },
        }
    }
}

// ============================================================================
// CALL MACHINE
// ============================================================================

#[derive(Debug)]
pub struct CallMachine {
    config: MachineConfig,
    session: Option<CallSession>,
    room: Option<String>,
}

impl CallMachine {
    pub fn new(config: MachineConfig) -> Self {
        Self {
            config,
            session: None,
            room: None,
        }
    }

    /// Status der aktuellen (oder zuletzt beendeten) Session
    pub fn state(&self) -> CallState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(CallState::Idle)
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    fn active(&self) -> Option<&CallSession> {
        self.session.as_ref().filter(|s| s.is_active())
    }

    // ========================================================================
    // USER ACTIONS
    // ========================================================================

    /// Startet einen ausgehenden Anruf an eine Endpoint-ID
    pub fn place_call(
        &mut self,
        target: &str,
    ) -> Result<(SessionId, Vec<Effect>), CallEngineError> {
        if self.active().is_some() {
            return Err(CallEngineError::AlreadyInCall);
        }
        Ok(self.start_outgoing(target.to_string()))
    }

    /// Tritt einem Raum bei; der Relay bestimmt später den Initiator
    pub fn join_room(&mut self, room_id: &str) -> Result<Vec<Effect>, CallEngineError> {
        if self.active().is_some() {
            return Err(CallEngineError::AlreadyInCall);
        }
        tracing::info!("Joining room {}", room_id);
        self.room = Some(room_id.to_string());
        Ok(vec![Effect::Send(ClientMessage::JoinRoom {
            room_id: room_id.to_string(),
        })])
    }

    pub fn accept(&mut self) -> Result<Vec<Effect>, CallEngineError> {
        let state = self.active().ok_or(CallEngineError::NoActiveCall)?.state;
        if state != CallState::RingingIn {
            return Err(CallEngineError::InvalidState(state));
        }
        Ok(self.accept_incoming())
    }

    /// Lehnt ab, ohne jemals Medien anzufordern
    pub fn reject(&mut self) -> Result<Vec<Effect>, CallEngineError> {
        let state = self.active().ok_or(CallEngineError::NoActiveCall)?.state;
        if state != CallState::RingingIn {
            return Err(CallEngineError::InvalidState(state));
        }
        Ok(self.end(EndReason::Rejected, Some(Signal::Reject)))
    }

    pub fn hangup(&mut self) -> Result<Vec<Effect>, CallEngineError> {
        let state = self.active().ok_or(CallEngineError::NoActiveCall)?.state;
        let signal = if state == CallState::RingingOut {
            Signal::Cancel
        } else {
            Signal::Hangup
        };
        Ok(self.end(EndReason::LocalHangup, Some(signal)))
    }

    // ========================================================================
    // EVENTS
    // ========================================================================

    pub fn handle(&mut self, event: MachineEvent) -> Vec<Effect> {
        match event {
            MachineEvent::Relay(message) => self.on_relay_message(message),
            MachineEvent::RelayDisconnected => self.on_relay_disconnected(),
            MachineEvent::RelayLagged { missed } => self.on_relay_lagged(missed),
            MachineEvent::MediaGranted { session_id, tracks } => {
                self.on_media_granted(session_id, tracks)
            }
            MachineEvent::MediaDenied { session_id, error } => {
                self.on_media_denied(session_id, error)
            }
            MachineEvent::Negotiator(report) => self.on_negotiator(report),
            MachineEvent::TimerFired { session_id, kind } => self.on_timer(session_id, kind),
            MachineEvent::PushCompleted { session_id, result } => {
                self.on_push_completed(session_id, result)
            }
        }
    }

    fn on_relay_message(&mut self, message: RelayMessage) -> Vec<Effect> {
        match message {
            RelayMessage::Initiate { session_id, from } => self.on_initiate(session_id, from),
            RelayMessage::Accept { session_id, from } => self.on_remote_accept(session_id, from),
            RelayMessage::Reject { session_id, from } => {
                self.on_declined(session_id, from, EndReason::Rejected)
            }
            RelayMessage::Busy { session_id, from } => {
                self.on_declined(session_id, from, EndReason::Busy)
            }
            RelayMessage::Cancel { session_id, from }
            | RelayMessage::Hangup { session_id, from } => {
                self.on_remote_hangup(session_id, from)
            }
            RelayMessage::Description {
                session_id,
                from,
                description,
            } => self.on_description(session_id, from, description),
            RelayMessage::Candidate {
                session_id,
                from,
                candidate,
            } => self.on_candidate(session_id, from, candidate),
            RelayMessage::PeerLeft {
                peer_id,
                session_id,
            } => self.on_peer_left(peer_id, session_id),
            RelayMessage::Delivered { session_id, to } => self.on_delivered(session_id, to),
            RelayMessage::PeerJoined { peer_id } => self.on_peer_joined(peer_id),
            RelayMessage::JoinedRoom { room_id } => {
                tracing::info!("Joined room {}. Waiting for peer...", room_id);
                vec![Effect::Notify(CallNotice::RoomJoined { room_id })]
            }
            RelayMessage::RoomFull { room_id } => {
                tracing::warn!("Room {} is full", room_id);
                self.room = None;
                vec![Effect::Notify(CallNotice::RoomFull { room_id })]
            }
            RelayMessage::Error { code, message } => {
                vec![Effect::Notify(CallNotice::RelayError { code, message })]
            }
            RelayMessage::Registered { .. } | RelayMessage::Pong => Vec::new(),
        }
    }

    fn on_initiate(&mut self, session_id: SessionId, from: String) -> Vec<Effect> {
        if let Some(active) = self.active() {
            if active.id == session_id && active.peer.as_deref() == Some(from.as_str()) {
                tracing::debug!("Duplicate initiate for {}", session_id);
                return Vec::new();
            }
            tracing::info!("Busy: rejecting call {} from {}", session_id, from);
            return vec![Effect::Send(ClientMessage::Busy {
                session_id,
                to: from,
            })];
        }

        tracing::info!("Incoming call {} from {}", session_id, from);
        let session = CallSession::incoming(session_id.clone(), from.clone());
        let mut effects = vec![state_changed(&session)];
        self.session = Some(session);
        effects.push(Effect::Notify(CallNotice::IncomingCall { session_id, from }));

        if self.config.auto_answer {
            tracing::info!("Auto-answering");
            effects.extend(self.accept_incoming());
        }
        effects
    }

    fn on_remote_accept(&mut self, session_id: SessionId, from: String) -> Vec<Effect> {
        let Some(session) = self.session_from_peer(&session_id, &from, "accept") else {
            return Vec::new();
        };
        if session.role != Role::Initiator || session.state != CallState::RingingOut {
            tracing::warn!("Ignoring accept while {:?}", session.state);
            return Vec::new();
        }

        tracing::info!("Call {} accepted by {}", session_id, from);
        session.state = CallState::Negotiating;
        session.negotiator_open = true;

        let mut effects = Vec::new();
        if session.timers.remove(&TimerKind::RingTimeout) {
            effects.push(Effect::CancelTimer {
                session_id: session_id.clone(),
                kind: TimerKind::RingTimeout,
            });
        }
        effects.push(state_changed(session));
        effects.push(Effect::OpenNegotiator {
            session_id: session_id.clone(),
        });
        effects.push(Effect::Negotiate {
            session_id: session_id.clone(),
            command: NegotiatorCommand::Start(session.local_tracks.clone()),
        });
        effects.push(Effect::Negotiate {
            session_id,
            command: NegotiatorCommand::CreateOffer,
        });
        effects
    }

    fn on_declined(&mut self, session_id: SessionId, from: String, reason: EndReason) -> Vec<Effect> {
        let Some(session) = self.session_from_peer(&session_id, &from, "decline") else {
            return Vec::new();
        };
        if session.state != CallState::RingingOut {
            tracing::warn!("Ignoring {:?} while {:?}", reason, session.state);
            return Vec::new();
        }
        self.end(reason, None)
    }

    fn on_remote_hangup(&mut self, session_id: SessionId, from: String) -> Vec<Effect> {
        let Some(session) = self.session_from_peer(&session_id, &from, "hangup") else {
            return Vec::new();
        };
        let reason = if session.state.is_ringing() {
            EndReason::Cancelled
        } else {
            EndReason::RemoteHangup
        };
        self.end(reason, None)
    }

    fn on_description(
        &mut self,
        session_id: SessionId,
        from: String,
        description: SessionDescription,
    ) -> Vec<Effect> {
        let Some(session) = self.session_from_peer(&session_id, &from, "description") else {
            return Vec::new();
        };

        let command = match (session.role, description.kind, session.state) {
            (Role::Responder, DescriptionKind::Offer, CallState::Negotiating)
                if session.negotiator_open =>
            {
                tracing::debug!("Received offer for {}", session_id);
                NegotiatorCommand::CreateAnswer(description)
            }
            (Role::Initiator, DescriptionKind::Answer, CallState::Negotiating) => {
                tracing::debug!("Received answer for {}", session_id);
                NegotiatorCommand::ApplyRemote(description)
            }
            (role, kind, state) => {
                tracing::warn!("Ignoring {:?} as {:?} while {:?}", kind, role, state);
                return Vec::new();
            }
        };

        vec![Effect::Negotiate {
            session_id,
            command,
        }]
    }

    fn on_candidate(
        &mut self,
        session_id: SessionId,
        from: String,
        candidate: Candidate,
    ) -> Vec<Effect> {
        let Some(session) = self.session_from_peer(&session_id, &from, "candidate") else {
            return Vec::new();
        };

        if session.remote_description_set {
            vec![Effect::Negotiate {
                session_id,
                command: NegotiatorCommand::AddCandidate(candidate),
            }]
        } else {
            session.pending_remote_candidates.push(candidate);
            tracing::debug!(
                "Buffered remote candidate ({} pending)",
                session.pending_remote_candidates.len()
            );
            Vec::new()
        }
    }

    fn on_peer_left(&mut self, peer_id: String, session_id: Option<SessionId>) -> Vec<Effect> {
        let Some(active) = self.active() else {
            tracing::debug!("Ignoring peer_left from {} without active call", peer_id);
            return Vec::new();
        };

        let matches_session = session_id.as_ref() == Some(&active.id);
        let matches_peer = active.peer.as_deref() == Some(peer_id.as_str());
        if !matches_session && !matches_peer {
            tracing::debug!("Ignoring peer_left from unrelated endpoint {}", peer_id);
            return Vec::new();
        }

        tracing::info!("Peer {} left", peer_id);
        self.end(EndReason::PeerLeft, None)
    }

    fn on_relay_disconnected(&mut self) -> Vec<Effect> {
        if self.active().is_none() {
            return Vec::new();
        }
        tracing::warn!("Relay disconnected during call");
        self.end(EndReason::PeerLeft, None)
    }

    /// Verlorene Signale lassen sich nicht nachholen: Session abbrechen
    /// und die Gegenseite informieren
    fn on_relay_lagged(&mut self, missed: u64) -> Vec<Effect> {
        let Some(active) = self.active() else {
            return Vec::new();
        };
        tracing::warn!("Lost {} relay messages during call {}", missed, active.id);
        let signal = if active.state == CallState::RingingOut {
            Signal::Cancel
        } else {
            Signal::Hangup
        };
        self.end(EndReason::ConnectionLost, Some(signal))
    }

    fn on_delivered(&mut self, session_id: SessionId, to: String) -> Vec<Effect> {
        let Some(session) = self.session_for(&session_id, "delivered") else {
            return Vec::new();
        };
        if session.role != Role::Initiator || session.push_dispatched {
            return Vec::new();
        }
        session.push_dispatched = true;
        vec![Effect::DispatchPush {
            session_id,
            target: to,
        }]
    }

    fn on_peer_joined(&mut self, peer_id: String) -> Vec<Effect> {
        if self.config.addressing != AddressingMode::Room {
            tracing::debug!("Ignoring peer_joined outside room mode");
            return Vec::new();
        }
        if self.active().is_some() {
            tracing::warn!("Ignoring peer_joined from {} during call", peer_id);
            return Vec::new();
        }
        tracing::info!("Peer {} joined the room", peer_id);
        self.start_outgoing(peer_id).1
    }

    fn on_media_granted(&mut self, session_id: SessionId, tracks: Vec<MediaTrack>) -> Vec<Effect> {
        let ring_timeout = self.config.ring_timeout;
        let Some(session) = self.session_for(&session_id, "media grant") else {
            // Freigabe kam nach dem Ende an
            return vec![Effect::ReleaseMedia { session_id }];
        };

        session.media_acquired = true;
        session.local_tracks = tracks.clone();

        match (session.role, session.state, session.peer.clone()) {
            (Role::Initiator, CallState::RingingOut, Some(peer)) => {
                tracing::info!("Calling {} ({})", peer, session_id);
                session.peer_aware = true;
                session.timers.insert(TimerKind::RingTimeout);
                vec![
                    Effect::Send(ClientMessage::Initiate {
                        session_id: session_id.clone(),
                        to: peer,
                    }),
                    Effect::ArmTimer {
                        session_id,
                        kind: TimerKind::RingTimeout,
                        after: ring_timeout,
                    },
                ]
            }
            (Role::Responder, CallState::Negotiating, Some(peer)) => {
                session.negotiator_open = true;
                vec![
                    Effect::OpenNegotiator {
                        session_id: session_id.clone(),
                    },
                    Effect::Negotiate {
                        session_id: session_id.clone(),
                        command: NegotiatorCommand::Start(tracks),
                    },
                    Effect::Send(Signal::Accept.message(session_id, peer)),
                ]
            }
            (role, state, _) => {
                tracing::warn!("Media granted as {:?} while {:?}", role, state);
                Vec::new()
            }
        }
    }

    fn on_media_denied(&mut self, session_id: SessionId, error: MediaError) -> Vec<Effect> {
        if self.session_for(&session_id, "media denial").is_none() {
            return Vec::new();
        }
        tracing::warn!("Media access failed: {}", error);
        self.end(EndReason::MediaDenied, Some(Signal::Reject))
    }

    fn on_negotiator(&mut self, report: NegotiatorReport) -> Vec<Effect> {
        let NegotiatorReport { session_id, event } = report;
        let Some(session) = self.session_for(&session_id, "negotiator event") else {
            return Vec::new();
        };

        match event {
            NegotiatorEvent::OfferCreated(offer) => {
                send_to_peer(session, |session_id, to| ClientMessage::Description {
                    session_id,
                    to,
                    description: offer,
                })
                .into_iter()
                .collect()
            }
            NegotiatorEvent::AnswerCreated(answer) => {
                session.remote_description_set = true;
                let mut effects: Vec<Effect> =
                    send_to_peer(session, |session_id, to| ClientMessage::Description {
                        session_id,
                        to,
                        description: answer,
                    })
                    .into_iter()
                    .collect();
                effects.extend(flush_candidates(session));
                effects
            }
            NegotiatorEvent::RemoteApplied => {
                session.remote_description_set = true;
                flush_candidates(session)
            }
            NegotiatorEvent::LocalCandidate(candidate) => {
                send_to_peer(session, |session_id, to| ClientMessage::Candidate {
                    session_id,
                    to,
                    candidate,
                })
                .into_iter()
                .collect()
            }
            NegotiatorEvent::CandidateRejected(e) => {
                tracing::warn!("Failed to add remote candidate: {}", e);
                Vec::new()
            }
            NegotiatorEvent::Connectivity(state) => self.on_connectivity(state),
            NegotiatorEvent::Failed(NegotiatorError::NotReady) => {
                tracing::warn!("Negotiator reported NotReady outside candidate handling");
                Vec::new()
            }
            NegotiatorEvent::Failed(e) => {
                tracing::error!("Negotiation failed for {}: {}", session_id, e);
                self.end(EndReason::NegotiationFailed, Some(Signal::Hangup))
            }
        }
    }

    fn on_connectivity(&mut self, connectivity: ConnectivityState) -> Vec<Effect> {
        let Some(session) = self.session.as_mut().filter(|s| s.is_active()) else {
            return Vec::new();
        };
        tracing::debug!("Connectivity {:?} while {:?}", connectivity, session.state);

        match (connectivity, session.state) {
            (ConnectivityState::Connected, CallState::Negotiating) => {
                tracing::info!("Call {} connected", session.id);
                session.state = CallState::Connected;
                session.connected_at = Some(Utc::now());

                let session_id = session.id.clone();
                let mut effects: Vec<Effect> = std::mem::take(&mut session.timers)
                    .into_iter()
                    .map(|kind| Effect::CancelTimer {
                        session_id: session_id.clone(),
                        kind,
                    })
                    .collect();
                effects.push(state_changed(session));
                effects.push(Effect::Notify(CallNotice::Connected { session_id }));
                effects
            }
            (
                ConnectivityState::Failed | ConnectivityState::Closed,
                CallState::Negotiating | CallState::Connected,
            ) => self.end(EndReason::ConnectionLost, Some(Signal::Hangup)),
            _ => Vec::new(),
        }
    }

    fn on_timer(&mut self, session_id: SessionId, kind: TimerKind) -> Vec<Effect> {
        let Some(session) = self.session_for(&session_id, "timer") else {
            return Vec::new();
        };
        if !session.timers.remove(&kind) {
            tracing::debug!("Ignoring cancelled timer {:?}", kind);
            return Vec::new();
        }

        match kind {
            TimerKind::RingTimeout if session.state == CallState::RingingOut => {
                tracing::info!("No answer for {}, cancelling", session_id);
                self.end(EndReason::TimedOut, Some(Signal::Cancel))
            }
            TimerKind::RingTimeout => Vec::new(),
        }
    }

    fn on_push_completed(
        &mut self,
        session_id: SessionId,
        result: Result<(), PushError>,
    ) -> Vec<Effect> {
        match result {
            Ok(()) => {
                tracing::debug!("Push notification sent for {}", session_id);
                Vec::new()
            }
            Err(e) => {
                tracing::warn!("Push notification failed for {}: {}", session_id, e);
                vec![Effect::Notify(CallNotice::PushFailed {
                    session_id,
                    message: e.to_string(),
                })]
            }
        }
    }

    // ========================================================================
    // TRANSITIONS
    // ========================================================================

    fn start_outgoing(&mut self, peer: String) -> (SessionId, Vec<Effect>) {
        let session = CallSession::outgoing(Some(peer));
        let session_id = session.id.clone();
        tracing::info!("Placing call {}", session_id);

        let effects = vec![
            state_changed(&session),
            Effect::AcquireMedia {
                session_id: session_id.clone(),
                kinds: self.config.media,
            },
        ];
        self.session = Some(session);
        (session_id, effects)
    }

    fn accept_incoming(&mut self) -> Vec<Effect> {
        let media = self.config.media;
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        tracing::info!("Accepting call {}", session.id);
        session.state = CallState::Negotiating;
        vec![
            state_changed(session),
            Effect::AcquireMedia {
                session_id: session.id.clone(),
                kinds: media,
            },
        ]
    }

    /// Einziger Weg nach `Ended`: gibt Timer, Negotiator und Medien genau
    /// einmal frei. Ein zweiter Aufruf ist ein No-op.
    fn end(&mut self, reason: EndReason, notify: Option<Signal>) -> Vec<Effect> {
        let Some(session) = self.session.as_mut().filter(|s| s.is_active()) else {
            return Vec::new();
        };
        let session_id = session.id.clone();
        let mut effects = Vec::new();

        if let Some(signal) = notify {
            effects.extend(send_to_peer(session, |session_id, to| {
                signal.message(session_id, to)
            }));
        }

        for kind in std::mem::take(&mut session.timers) {
            effects.push(Effect::CancelTimer {
                session_id: session_id.clone(),
                kind,
            });
        }
        if session.negotiator_open {
            session.negotiator_open = false;
            effects.push(Effect::CloseNegotiator {
                session_id: session_id.clone(),
            });
        }
        if session.media_acquired {
            session.media_acquired = false;
            effects.push(Effect::ReleaseMedia {
                session_id: session_id.clone(),
            });
        }
        session.pending_remote_candidates.clear();
        session.local_tracks.clear();
        session.state = CallState::Ended(reason);

        tracing::info!("Call {} ended: {:?}", session_id, reason);

        effects.push(state_changed(session));
        effects.push(Effect::Notify(CallNotice::Ended {
            session_id,
            reason,
            duration: session.duration(),
        }));
        effects
    }

    // ========================================================================
    // LOOKUP
    // ========================================================================

    /// Aktive Session mit passender ID; alles andere wird geloggt und verworfen
    fn session_for(&mut self, session_id: &SessionId, what: &str) -> Option<&mut CallSession> {
        match self.session.as_mut() {
            Some(session) if &session.id == session_id => {
                if session.is_active() {
                    Some(session)
                } else {
                    tracing::debug!("Ignoring {} for ended session {}", what, session_id);
                    None
                }
            }
            _ => {
                tracing::debug!("Ignoring {} for unknown session {}", what, session_id);
                None
            }
        }
    }

    /// Wie [`Self::session_for`], prüft zusätzlich den Absender
    fn session_from_peer(
        &mut self,
        session_id: &SessionId,
        from: &str,
        what: &str,
    ) -> Option<&mut CallSession> {
        let session = self.session_for(session_id, what)?;
        if session.peer.as_deref() != Some(from) {
            tracing::warn!("Ignoring {} from unexpected endpoint {}", what, from);
            return None;
        }
        Some(session)
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn state_changed(session: &CallSession) -> Effect {
    Effect::Notify(CallNotice::StateChanged {
        session_id: session.id.clone(),
        state: session.state,
    })
}

/// Nachricht an die Gegenseite, sofern diese die Session kennt
fn send_to_peer<F>(session: &CallSession, build: F) -> Option<Effect>
where
    F: FnOnce(SessionId, String) -> ClientMessage,
{
    if !session.peer_aware {
        return None;
    }
    let to = session.peer.clone()?;
    Some(Effect::Send(build(session.id.clone(), to)))
}

/// Gepufferte Candidates in Ankunftsreihenfolge genau einmal ausspielen
fn flush_candidates(session: &mut CallSession) -> Vec<Effect> {
    let pending = std::mem::take(&mut session.pending_remote_candidates);
    if !pending.is_empty() {
        tracing::debug!("Applying {} buffered remote candidates", pending.len());
    }
    pending
        .into_iter()
        .map(|candidate| Effect::Negotiate {
            session_id: session.id.clone(),
            command: NegotiatorCommand::AddCandidate(candidate),
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
