//! Call Controller
//!
//! Asynchrone Hülle um die [`CallMachine`]: eine einzige Dispatch-Schleife
//! nimmt Benutzerbefehle, Relay-Events, Negotiator-Reports, Timer und
//! Medienfreigaben entgegen und führt die resultierenden [`Effect`]s aus.
//! Damit werden alle Ereignisse einer Session strikt nacheinander verarbeitet.

use super::machine::{CallEngineError, CallMachine, CallNotice, Effect, MachineConfig, MachineEvent};
use super::media::{MediaCapture, MediaError, MediaKinds, MediaSource};
use super::negotiator::{NegotiatorHandle, NegotiatorReport};
use super::push::PushNotifier;
use super::session::{CallState, TimerKind};
use super::transport::TransportFactory;
use crate::signaling::{ClientMessage, RelayClient, RelayEvent, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;

/// Kapazität der Befehls-Queue
const COMMAND_QUEUE: usize = 32;

/// Kapazität des Notice-Broadcasts
const NOTICE_CAPACITY: usize = 128;

// ============================================================================
// COMMANDS & HANDLE
// ============================================================================

type Reply<T> = oneshot::Sender<Result<T, CallEngineError>>;

enum ControlCommand {
    PlaceCall { target: String, reply: Reply<SessionId> },
    JoinRoom { room_id: String, reply: Reply<()> },
    Accept { reply: Reply<()> },
    Reject { reply: Reply<()> },
    Hangup { reply: Reply<()> },
    SetMuted { muted: bool, reply: Reply<()> },
    State { reply: oneshot::Sender<CallState> },
    Shutdown,
}

/// Klonbarer Zugriff auf einen laufenden [`CallController`]
#[derive(Clone)]
pub struct CallHandle {
    tx: mpsc::Sender<ControlCommand>,
    notices: broadcast::Sender<CallNotice>,
}

impl CallHandle {
    pub async fn place_call(&self, target: &str) -> Result<SessionId, CallEngineError> {
        let target = target.to_string();
        self.request(|reply| ControlCommand::PlaceCall { target, reply })
            .await
    }

    pub async fn join_room(&self, room_id: &str) -> Result<(), CallEngineError> {
        let room_id = room_id.to_string();
        self.request(|reply| ControlCommand::JoinRoom { room_id, reply })
            .await
    }

    pub async fn accept(&self) -> Result<(), CallEngineError> {
        self.request(|reply| ControlCommand::Accept { reply }).await
    }

    pub async fn reject(&self) -> Result<(), CallEngineError> {
        self.request(|reply| ControlCommand::Reject { reply }).await
    }

    pub async fn hangup(&self) -> Result<(), CallEngineError> {
        self.request(|reply| ControlCommand::Hangup { reply }).await
    }

    /// Schaltet das Mikrofon stumm, ohne neu zu verhandeln
    pub async fn set_muted(&self, muted: bool) -> Result<(), CallEngineError> {
        self.request(|reply| ControlCommand::SetMuted { muted, reply })
            .await
    }

    pub async fn state(&self) -> Result<CallState, CallEngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControlCommand::State { reply })
            .await
            .map_err(|_| CallEngineError::Stopped)?;
        rx.await.map_err(|_| CallEngineError::Stopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallNotice> {
        self.notices.subscribe()
    }

    /// Legt einen laufenden Anruf auf und beendet die Dispatch-Schleife
    pub async fn shutdown(&self) {
        let _ = self.tx.send(ControlCommand::Shutdown).await;
    }

    async fn request<T, B>(&self, build: B) -> Result<T, CallEngineError>
    where
        B: FnOnce(Reply<T>) -> ControlCommand,
    {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| CallEngineError::Stopped)?;
        rx.await.map_err(|_| CallEngineError::Stopped)?
    }
}

// ============================================================================
// CONTROLLER
// ============================================================================

/// Ergebnisse von Hintergrund-Tasks
enum Internal {
    Media {
        session_id: SessionId,
        result: Result<Box<dyn MediaCapture>, MediaError>,
    },
    Machine(MachineEvent),
}

pub struct CallController<R, F, M, P>
where
    R: RelayClient,
    F: TransportFactory,
    M: MediaSource,
    P: PushNotifier,
{
    commands: mpsc::Receiver<ControlCommand>,
    internal: mpsc::UnboundedReceiver<Internal>,
    reports: mpsc::UnboundedReceiver<NegotiatorReport>,
    relay_events: broadcast::Receiver<RelayEvent>,
    dispatcher: Dispatcher<R, F, M, P>,
}

impl<R, F, M, P> CallController<R, F, M, P>
where
    R: RelayClient,
    F: TransportFactory,
    M: MediaSource,
    P: PushNotifier,
{
    pub fn new(
        config: MachineConfig,
        relay: Arc<R>,
        factory: Arc<F>,
        media: Arc<M>,
        push: Arc<P>,
    ) -> (Self, CallHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        // Vor dem ersten connect abonnieren, damit nichts verloren geht
        let relay_events = relay.subscribe();

        let handle = CallHandle {
            tx: commands_tx,
            notices: notices.clone(),
        };

        let controller = Self {
            commands,
            internal,
            reports,
            relay_events,
            dispatcher: Dispatcher {
                machine: CallMachine::new(config),
                relay,
                factory,
                media,
                push,
                internal_tx,
                reports_tx,
                notices,
                negotiator: None,
                capture: None,
                timers: HashMap::new(),
            },
        };

        (controller, handle)
    }

    /// Dispatch-Schleife; endet mit `shutdown` oder wenn alle Handles weg sind
    pub async fn run(self) {
        let Self {
            mut commands,
            mut internal,
            mut reports,
            mut relay_events,
            mut dispatcher,
        } = self;
        let mut relay_open = true;

        tracing::info!("Call controller started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ControlCommand::Shutdown) | None => break,
                    Some(command) => dispatcher.on_command(command).await,
                },
                Some(message) = internal.recv() => dispatcher.on_internal(message).await,
                Some(report) = reports.recv() => {
                    dispatcher.dispatch(MachineEvent::Negotiator(report)).await;
                }
                event = relay_events.recv(), if relay_open => match event {
                    Ok(event) => dispatcher.on_relay_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Relay event receiver lagged by {} messages", n);
                        dispatcher.dispatch(MachineEvent::RelayLagged { missed: n }).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!("Relay event stream closed");
                        relay_open = false;
                        dispatcher.dispatch(MachineEvent::RelayDisconnected).await;
                    }
                },
            }
        }

        dispatcher.shutdown().await;
        tracing::info!("Call controller stopped");
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// Besitzt Maschine und Ressourcen; läuft nur innerhalb von `run`
struct Dispatcher<R, F, M, P> {
    machine: CallMachine,
    relay: Arc<R>,
    factory: Arc<F>,
    media: Arc<M>,
    push: Arc<P>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    reports_tx: mpsc::UnboundedSender<NegotiatorReport>,
    notices: broadcast::Sender<CallNotice>,
    negotiator: Option<NegotiatorHandle>,
    capture: Option<(SessionId, Box<dyn MediaCapture>)>,
    timers: HashMap<(SessionId, TimerKind), AbortHandle>,
}

impl<R, F, M, P> Dispatcher<R, F, M, P>
where
    R: RelayClient,
    F: TransportFactory,
    M: MediaSource,
    P: PushNotifier,
{
    async fn on_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::PlaceCall { target, reply } => {
                let result = match self.ensure_connected().await {
                    Ok(()) => self.machine.place_call(&target),
                    Err(e) => Err(e),
                };
                let result = match result {
                    Ok((session_id, effects)) => {
                        self.execute(effects).await;
                        Ok(session_id)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            ControlCommand::JoinRoom { room_id, reply } => {
                let result = match self.ensure_connected().await {
                    Ok(()) => self.machine.join_room(&room_id),
                    Err(e) => Err(e),
                };
                let _ = reply.send(self.apply(result).await);
            }
            ControlCommand::Accept { reply } => {
                let result = self.machine.accept();
                let _ = reply.send(self.apply(result).await);
            }
            ControlCommand::Reject { reply } => {
                let result = self.machine.reject();
                let _ = reply.send(self.apply(result).await);
            }
            ControlCommand::Hangup { reply } => {
                let result = self.machine.hangup();
                let _ = reply.send(self.apply(result).await);
            }
            ControlCommand::SetMuted { muted, reply } => {
                let result = match self.capture.as_mut() {
                    Some((_, capture)) => {
                        capture.set_muted(muted);
                        Ok(())
                    }
                    None => Err(CallEngineError::NoActiveCall),
                };
                let _ = reply.send(result);
            }
            ControlCommand::State { reply } => {
                let _ = reply.send(self.machine.state());
            }
            ControlCommand::Shutdown => {}
        }
    }

    async fn apply(
        &mut self,
        result: Result<Vec<Effect>, CallEngineError>,
    ) -> Result<(), CallEngineError> {
        let effects = result?;
        self.execute(effects).await;
        Ok(())
    }

    async fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::Media {
                session_id,
                result: Ok(capture),
            } => {
                let tracks = capture.tracks();
                // Vorherige Freigabe (alte Session) zuerst abgeben
                if let Some((old_id, mut old)) = self.capture.replace((session_id.clone(), capture)) {
                    tracing::warn!("Releasing leftover media of {}", old_id);
                    old.release();
                }
                self.dispatch(MachineEvent::MediaGranted { session_id, tracks })
                    .await;
            }
            Internal::Media {
                session_id,
                result: Err(error),
            } => {
                self.dispatch(MachineEvent::MediaDenied { session_id, error })
                    .await;
            }
            Internal::Machine(event) => {
                if let MachineEvent::TimerFired { session_id, kind } = &event {
                    self.timers.remove(&(session_id.clone(), *kind));
                }
                self.dispatch(event).await;
            }
        }
    }

    async fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connected => tracing::debug!("Relay connected"),
            RelayEvent::Disconnected => self.dispatch(MachineEvent::RelayDisconnected).await,
            RelayEvent::Message(message) => self.dispatch(MachineEvent::Relay(message)).await,
        }
    }

    async fn dispatch(&mut self, event: MachineEvent) {
        let effects = self.machine.handle(event);
        self.execute(effects).await;
    }

    async fn ensure_connected(&mut self) -> Result<(), CallEngineError> {
        if self.relay.is_connected() {
            return Ok(());
        }
        let endpoint_id = self.relay.connect().await?;
        tracing::info!("Registered with relay as {}", endpoint_id);
        Ok(())
    }

    // ========================================================================
    // EFFECTS
    // ========================================================================

    async fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(message) => self.send(message).await,
                Effect::AcquireMedia { session_id, kinds } => self.acquire_media(session_id, kinds),
                Effect::ReleaseMedia { session_id } => self.release_media(&session_id),
                Effect::OpenNegotiator { session_id } => self.open_negotiator(session_id),
                Effect::Negotiate {
                    session_id,
                    command,
                } => match &self.negotiator {
                    Some(handle) if handle.session_id() == &session_id => handle.submit(command),
                    _ => tracing::warn!("No negotiator for {}", session_id),
                },
                Effect::CloseNegotiator { session_id } => {
                    if self
                        .negotiator
                        .as_ref()
                        .is_some_and(|h| h.session_id() == &session_id)
                    {
                        if let Some(handle) = self.negotiator.take() {
                            handle.close();
                        }
                    }
                }
                Effect::ArmTimer {
                    session_id,
                    kind,
                    after,
                } => self.arm_timer(session_id, kind, after),
                Effect::CancelTimer { session_id, kind } => {
                    if let Some(timer) = self.timers.remove(&(session_id, kind)) {
                        timer.abort();
                    }
                }
                Effect::DispatchPush { session_id, target } => self.dispatch_push(session_id, target),
                Effect::Notify(notice) => {
                    let _ = self.notices.send(notice);
                }
            }
        }
    }

    /// Best-effort: Fehler werden nur geloggt
    async fn send(&mut self, message: ClientMessage) {
        let kind = message.kind();
        if let Err(e) = self.relay.send(message).await {
            tracing::warn!("Failed to send {}: {}", kind, e);
        }
    }

    fn acquire_media(&mut self, session_id: SessionId, kinds: MediaKinds) {
        let media = Arc::clone(&self.media);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = media.acquire(kinds).await;
            let _ = tx.send(Internal::Media { session_id, result });
        });
    }

    fn release_media(&mut self, session_id: &SessionId) {
        match self.capture.take() {
            Some((id, mut capture)) if &id == session_id => {
                capture.release();
                tracing::debug!("Released media of {}", session_id);
            }
            other => self.capture = other,
        }
    }

    fn open_negotiator(&mut self, session_id: SessionId) {
        if let Some(old) = self.negotiator.take() {
            tracing::warn!("Closing leftover negotiator of {}", old.session_id());
            old.close();
        }
        self.negotiator = Some(NegotiatorHandle::spawn(
            session_id,
            Arc::clone(&self.factory),
            self.reports_tx.clone(),
        ));
    }

    fn arm_timer(&mut self, session_id: SessionId, kind: TimerKind, after: Duration) {
        let tx = self.internal_tx.clone();
        let fired_id = session_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(Internal::Machine(MachineEvent::TimerFired {
                session_id: fired_id,
                kind,
            }));
        });
        if let Some(previous) = self.timers.insert((session_id, kind), task.abort_handle()) {
            previous.abort();
        }
    }

    fn dispatch_push(&mut self, session_id: SessionId, target: String) {
        let push = Arc::clone(&self.push);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = push.notify(&target, &session_id).await;
            let _ = tx.send(Internal::Machine(MachineEvent::PushCompleted { session_id, result }));
        });
    }

    async fn shutdown(&mut self) {
        if let Ok(effects) = self.machine.hangup() {
            self.execute(effects).await;
        }
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        if let Some(handle) = self.negotiator.take() {
            handle.close();
        }
        if let Some((_, mut capture)) = self.capture.take() {
            capture.release();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
