//! Signaling Module - Relay Client
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Relay:
//! - WebSocket-Verbindung aufbauen und halten
//! - Nachrichten serialisieren und senden
//! - Eingehende Nachrichten parsen und als Events weiterleiten
//!

mod client;
mod messages;

pub use client::{RelayClient, RelayError, RelayEvent, SignalingClient};
pub use messages::*;
