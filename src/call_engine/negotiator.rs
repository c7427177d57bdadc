//! Session Negotiator
//!
//! Erzwingt die Offer/Answer-Reihenfolge über einem [`MediaTransport`] und
//! läuft pro Session als eigener Task. Befehle werden strikt in
//! Einreihungs-Reihenfolge abgearbeitet, Ergebnisse kommen als
//! [`NegotiatorReport`] zurück.

use super::media::MediaTrack;
use super::transport::{
    ConnectivityState, MediaTransport, TransportError, TransportEvent, TransportFactory,
};
use crate::signaling::{Candidate, DescriptionKind, SessionDescription, SessionId};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiatorError {
    #[error("A negotiation is already in progress")]
    OfferInProgress,

    #[error("Expected a remote offer, got {0:?}")]
    NotAnOffer(DescriptionKind),

    #[error("Expected a remote answer, got {0:?}")]
    NotAnAnswer(DescriptionKind),

    #[error("No local offer outstanding")]
    NoOfferOutstanding,

    #[error("Remote description not set yet")]
    NotReady,

    #[error("Negotiator closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

// ============================================================================
// SESSION NEGOTIATOR
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalingPhase {
    Stable,
    HaveLocalOffer,
}

pub struct SessionNegotiator<T: MediaTransport> {
    transport: T,
    started: bool,
    phase: SignalingPhase,
    remote_description_set: bool,
    closed: bool,
}

impl<T: MediaTransport> SessionNegotiator<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            started: false,
            phase: SignalingPhase::Stable,
            remote_description_set: false,
            closed: false,
        }
    }

    /// Hängt die lokalen Tracks an; ein zweiter Aufruf ist ein No-op
    pub async fn start(&mut self, tracks: &[MediaTrack]) -> Result<(), NegotiatorError> {
        self.ensure_open()?;
        if self.started {
            return Ok(());
        }

        for track in tracks {
            self.transport.add_track(track).await?;
        }
        self.started = true;
        Ok(())
    }

    pub async fn create_local_offer(&mut self) -> Result<SessionDescription, NegotiatorError> {
        self.ensure_open()?;
        if self.phase != SignalingPhase::Stable {
            return Err(NegotiatorError::OfferInProgress);
        }

        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(&offer).await?;
        self.phase = SignalingPhase::HaveLocalOffer;
        Ok(offer)
    }

    /// Übernimmt das entfernte Offer und erzeugt die Antwort
    pub async fn create_local_answer(
        &mut self,
        remote: &SessionDescription,
    ) -> Result<SessionDescription, NegotiatorError> {
        self.ensure_open()?;
        if remote.kind != DescriptionKind::Offer {
            return Err(NegotiatorError::NotAnOffer(remote.kind));
        }
        if self.phase != SignalingPhase::Stable {
            return Err(NegotiatorError::OfferInProgress);
        }

        self.transport.set_remote_description(remote).await?;
        self.remote_description_set = true;

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(&answer).await?;
        Ok(answer)
    }

    /// Übernimmt die Antwort auf das eigene Offer
    pub async fn apply_remote_description(
        &mut self,
        remote: &SessionDescription,
    ) -> Result<(), NegotiatorError> {
        self.ensure_open()?;
        if self.phase != SignalingPhase::HaveLocalOffer {
            return Err(NegotiatorError::NoOfferOutstanding);
        }
        if remote.kind != DescriptionKind::Answer {
            return Err(NegotiatorError::NotAnAnswer(remote.kind));
        }

        self.transport.set_remote_description(remote).await?;
        self.remote_description_set = true;
        self.phase = SignalingPhase::Stable;
        Ok(())
    }

    /// Schlägt mit `NotReady` fehl, solange keine Remote Description gesetzt ist
    pub async fn add_remote_candidate(
        &mut self,
        candidate: &Candidate,
    ) -> Result<(), NegotiatorError> {
        self.ensure_open()?;
        if !self.remote_description_set {
            return Err(NegotiatorError::NotReady);
        }
        self.transport.add_candidate(candidate).await?;
        Ok(())
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.transport.close().await {
            tracing::warn!("Failed to close transport: {}", e);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<(), NegotiatorError> {
        if self.closed {
            Err(NegotiatorError::Closed)
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// NEGOTIATOR ACTOR
// ============================================================================

/// Befehle an den Negotiator einer Session
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatorCommand {
    Start(Vec<MediaTrack>),
    CreateOffer,
    CreateAnswer(SessionDescription),
    ApplyRemote(SessionDescription),
    AddCandidate(Candidate),
}

/// Ergebnisse und Transport-Events des Negotiators
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatorEvent {
    OfferCreated(SessionDescription),
    /// Remote Offer gesetzt, Antwort erzeugt
    AnswerCreated(SessionDescription),
    /// Remote Answer gesetzt
    RemoteApplied,
    /// Einzelner Candidate abgelehnt (nicht fatal)
    CandidateRejected(NegotiatorError),
    LocalCandidate(Candidate),
    Connectivity(ConnectivityState),
    Failed(NegotiatorError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatorReport {
    pub session_id: SessionId,
    pub event: NegotiatorEvent,
}

#[derive(Debug)]
enum ActorMessage {
    Command(NegotiatorCommand),
    Close,
}

/// Handle auf den Negotiator-Task einer Session
#[derive(Debug)]
pub struct NegotiatorHandle {
    session_id: SessionId,
    tx: mpsc::UnboundedSender<ActorMessage>,
}

impl NegotiatorHandle {
    /// Startet den Negotiator-Task; der Transport wird im Task erzeugt
    pub fn spawn<F: TransportFactory>(
        session_id: SessionId,
        factory: Arc<F>,
        reports: mpsc::UnboundedSender<NegotiatorReport>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_actor(session_id.clone(), factory, rx, reports));
        Self { session_id, tx }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn submit(&self, command: NegotiatorCommand) {
        if self.tx.send(ActorMessage::Command(command)).is_err() {
            tracing::warn!("Negotiator for {} is gone", self.session_id);
        }
    }

    /// Schließt den Transport; weitere Befehle werden verworfen
    pub fn close(self) {
        let _ = self.tx.send(ActorMessage::Close);
    }
}

async fn run_actor<F: TransportFactory>(
    session_id: SessionId,
    factory: Arc<F>,
    mut commands: mpsc::UnboundedReceiver<ActorMessage>,
    reports: mpsc::UnboundedSender<NegotiatorReport>,
) {
    let report = |event: NegotiatorEvent| {
        let _ = reports.send(NegotiatorReport {
            session_id: session_id.clone(),
            event,
        });
    };

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let transport = match factory.create(events_tx).await {
        Ok(transport) => transport,
        Err(e) => {
            tracing::error!("Failed to create transport for {}: {}", session_id, e);
            report(NegotiatorEvent::Failed(e.into()));
            return;
        }
    };
    let mut negotiator = SessionNegotiator::new(transport);

    tracing::debug!("Negotiator for {} started", session_id);

    loop {
        tokio::select! {
            message = commands.recv() => match message {
                Some(ActorMessage::Command(command)) => {
                    if let Some(event) = execute(&mut negotiator, command).await {
                        report(event);
                    }
                }
                Some(ActorMessage::Close) | None => break,
            },
            Some(event) = events.recv() => {
                let event = match event {
                    TransportEvent::LocalCandidate(c) => NegotiatorEvent::LocalCandidate(c),
                    TransportEvent::ConnectivityChanged(s) => NegotiatorEvent::Connectivity(s),
                };
                report(event);
            }
        }
    }

    negotiator.close().await;
    tracing::debug!("Negotiator for {} closed", session_id);
}

async fn execute<T: MediaTransport>(
    negotiator: &mut SessionNegotiator<T>,
    command: NegotiatorCommand,
) -> Option<NegotiatorEvent> {
    match command {
        NegotiatorCommand::Start(tracks) => negotiator
            .start(&tracks)
            .await
            .err()
            .map(NegotiatorEvent::Failed),
        NegotiatorCommand::CreateOffer => Some(match negotiator.create_local_offer().await {
            Ok(offer) => NegotiatorEvent::OfferCreated(offer),
            Err(e) => NegotiatorEvent::Failed(e),
        }),
        NegotiatorCommand::CreateAnswer(remote) => {
            Some(match negotiator.create_local_answer(&remote).await {
                Ok(answer) => NegotiatorEvent::AnswerCreated(answer),
                Err(e) => NegotiatorEvent::Failed(e),
            })
        }
        NegotiatorCommand::ApplyRemote(remote) => {
            Some(match negotiator.apply_remote_description(&remote).await {
                Ok(()) => NegotiatorEvent::RemoteApplied,
                Err(e) => NegotiatorEvent::Failed(e),
            })
        }
        NegotiatorCommand::AddCandidate(candidate) => negotiator
            .add_remote_candidate(&candidate)
            .await
            .err()
            .map(NegotiatorEvent::CandidateRejected),
    }
}

// ============================================================================
// TESTS
// ============================================================================
