//! Test-Doubles für Relay, Transport, Medien und Push

use crate::call_engine::{
    MediaCapture, MediaError, MediaKind, MediaKinds, MediaSource, MediaTrack, MediaTransport,
    PushError, PushNotifier, TransportError, TransportEvent, TransportFactory,
};
use crate::signaling::{
    Candidate, ClientMessage, DescriptionKind, RelayClient, RelayError, RelayEvent, RelayMessage,
    SessionDescription, SessionId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Wartet (max. ~2s) bis `condition` erfüllt ist
pub async fn wait_until<C: Fn() -> bool>(condition: C) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

// ============================================================================
// RELAY
// ============================================================================

pub struct FakeRelay {
    endpoint_id: String,
    connected: Mutex<bool>,
    connect_calls: AtomicUsize,
    sent: Mutex<Vec<ClientMessage>>,
    event_tx: broadcast::Sender<RelayEvent>,
}

impl FakeRelay {
    pub fn connected(endpoint_id: &str) -> Self {
        let relay = Self::disconnected(endpoint_id);
        *relay.connected.lock() = true;
        relay
    }

    pub fn disconnected(endpoint_id: &str) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            endpoint_id: endpoint_id.to_string(),
            connected: Mutex::new(false),
            connect_calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            event_tx,
        }
    }

    /// Simuliert eine Nachricht vom Relay
    pub fn inject(&self, message: RelayMessage) {
        let _ = self.event_tx.send(RelayEvent::Message(message));
    }

    pub fn drop_connection(&self) {
        *self.connected.lock() = false;
        let _ = self.event_tx.send(RelayEvent::Disconnected);
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(ClientMessage::kind).collect()
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayClient for FakeRelay {
    async fn connect(&self) -> Result<String, RelayError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        *self.connected.lock() = true;
        let _ = self.event_tx.send(RelayEvent::Connected);
        Ok(self.endpoint_id.clone())
    }

    async fn send(&self, message: ClientMessage) -> Result<(), RelayError> {
        if !*self.connected.lock() {
            return Err(RelayError::NotConnected);
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.event_tx.subscribe()
    }

    fn endpoint_id(&self) -> Option<String> {
        Some(self.endpoint_id.clone())
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock()
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    AddTrack(MediaKind),
    CreateOffer,
    CreateAnswer,
    SetLocal(DescriptionKind),
    SetRemote(DescriptionKind),
    AddCandidate(String),
    Close,
}

/// Zeichnet alle Aufrufe auf und liefert feste Descriptions
pub struct FakeTransport {
    calls: Arc<Mutex<Vec<TransportCall>>>,
}

impl FakeTransport {
    pub fn new() -> (Self, Arc<Mutex<Vec<TransportCall>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn add_track(&mut self, track: &MediaTrack) -> Result<(), TransportError> {
        self.record(TransportCall::AddTrack(track.kind));
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        self.record(TransportCall::CreateOffer);
        Ok(SessionDescription::offer("v=0 fake offer"))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError> {
        self.record(TransportCall::CreateAnswer);
        Ok(SessionDescription::answer("v=0 fake answer"))
    }

    async fn set_local_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::SetLocal(description.kind));
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::SetRemote(description.kind));
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: &Candidate) -> Result<(), TransportError> {
        self.record(TransportCall::AddCandidate(candidate.candidate.clone()));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.record(TransportCall::Close);
        Ok(())
    }
}

/// Teilt das Aufruf-Log über alle erzeugten Transports
pub struct FakeTransportFactory {
    calls: Arc<Mutex<Vec<TransportCall>>>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            events: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    /// Speist ein Transport-Event in den zuletzt erzeugten Transport;
    /// `false` solange noch keiner existiert
    pub fn emit(&self, event: TransportEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    type Transport = FakeTransport;

    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<FakeTransport, TransportError> {
        *self.events.lock() = Some(events);
        Ok(FakeTransport {
            calls: Arc::clone(&self.calls),
        })
    }
}

// ============================================================================
// MEDIA
// ============================================================================

pub struct FakeMedia {
    deny: bool,
    acquired: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl FakeMedia {
    pub fn granting() -> Self {
        Self {
            deny: false,
            acquired: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn denying() -> Self {
        Self {
            deny: true,
            ..Self::granting()
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for FakeMedia {
    async fn acquire(&self, kinds: MediaKinds) -> Result<Box<dyn MediaCapture>, MediaError> {
        if self.deny {
            return Err(MediaError::AccessDenied("denied by test".to_string()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCapture {
            tracks: kinds
                .kinds()
                .into_iter()
                .map(|kind| MediaTrack {
                    id: format!("fake-{:?}", kind),
                    kind,
                })
                .collect(),
            muted: false,
            released: Arc::clone(&self.released),
        }))
    }
}

struct FakeCapture {
    tracks: Vec<MediaTrack>,
    muted: bool,
    released: Arc<AtomicUsize>,
}

impl MediaCapture for FakeCapture {
    fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.clone()
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    fn is_muted(&self) -> bool {
        self.muted
    }

    fn release(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// PUSH
// ============================================================================

#[derive(Default)]
pub struct RecordingPush {
    sent: Mutex<Vec<(String, SessionId)>>,
}

impl RecordingPush {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, SessionId)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl PushNotifier for RecordingPush {
    async fn notify(&self, target: &str, session_id: &SessionId) -> Result<(), PushError> {
        self.sent.lock().push((target.to_string(), session_id.clone()));
        Ok(())
    }
}
