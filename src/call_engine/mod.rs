//! Call Engine Module - Anruf-Signalisierung
//!
//! Dieses Modul verwaltet:
//! - Call State Machine (Caller- und Callee-Seite)
//! - Session Negotiator (Offer/Answer, Candidates)
//! - Media Transport (WebRTC Peer Connection)
//! - Lokale Medien und Push-Benachrichtigung

mod controller;
mod machine;
mod media;
mod negotiator;
mod push;
mod session;
mod transport;

pub use controller::{CallController, CallHandle};
pub use machine::{CallEngineError, CallMachine, CallNotice, Effect, MachineConfig, MachineEvent};
pub use media::{HeadlessMedia, MediaCapture, MediaError, MediaKind, MediaKinds, MediaSource, MediaTrack};
pub use negotiator::{
    NegotiatorCommand, NegotiatorError, NegotiatorEvent, NegotiatorHandle, NegotiatorReport,
    SessionNegotiator,
};
pub use push::{NoPush, PushError, PushNotifier};
pub use session::{CallSession, CallState, EndReason, Role, TimerKind};
pub use transport::{
    ConnectivityState, MediaTransport, RtcTransport, RtcTransportFactory, TransportError,
    TransportEvent, TransportFactory,
};
