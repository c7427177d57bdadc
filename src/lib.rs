//! ringr - P2P Call Signaling
//!
//! Ein Client für Audio/Video-Anrufe zwischen zwei Endpoints mit:
//! - WebSocket-Relay für die Signalisierung
//! - WebRTC für den direkten Medienpfad
//! - Deterministischer State Machine für Caller und Callee

pub mod call_engine;
pub mod config;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use call_engine::{CallController, CallEngineError, CallHandle, CallNotice, CallState, EndReason};
pub use config::Config;
pub use signaling::{RelayClient, SignalingClient};

/// Standard-Filter, falls `RUST_LOG` nicht gesetzt ist
pub const DEFAULT_LOG_FILTER: &str = "ringr=debug,webrtc=warn";

/// Initialisiert das Logging; ein zweiter Aufruf ist ein No-op
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
