//! WebSocket Client für den Signaling-Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Registrierung mit Timeout
//! - Heartbeat-Keeping
//! - Event-basierte Weitergabe eingehender Nachrichten

use super::messages::*;
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Maximale Wartezeit auf `registered`
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum RelayError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to relay")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Relay error: {code} - {message}")]
    Server { code: i32, message: String },
}

// ============================================================================
// RELAY EVENTS
// ============================================================================

/// Events die vom Relay-Client ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Verbunden mit dem Relay
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Eingehende Nachricht (Reihenfolge pro Absender bleibt erhalten)
    Message(RelayMessage),
}

// ============================================================================
// RELAY CLIENT TRAIT
// ============================================================================

/// Kanal-Abstraktion, über die ein Endpoint mit dem Relay spricht
#[async_trait]
pub trait RelayClient: Send + Sync + 'static {
    /// Baut die Verbindung auf und liefert die eigene Endpoint-ID
    async fn connect(&self) -> Result<String, RelayError>;

    /// Best-effort Versand; Fehler betreffen nur den lokalen Kanal
    async fn send(&self, message: ClientMessage) -> Result<(), RelayError>;

    /// Gibt einen Event-Receiver zurück
    fn subscribe(&self) -> broadcast::Receiver<RelayEvent>;

    /// Eigene Endpoint-ID (falls registriert)
    fn endpoint_id(&self) -> Option<String>;

    /// Prüft ob verbunden
    fn is_connected(&self) -> bool;
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    endpoint_id: Option<String>,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket-Implementierung von [`RelayClient`]
pub struct SignalingClient {
    server_url: String,
    username: Option<String>,
    heartbeat_interval: Duration,
    state: Arc<RwLock<ClientState>>,
    tx: RwLock<Option<mpsc::Sender<String>>>,
    event_tx: broadcast::Sender<RelayEvent>,
    /// Read-, Write- und Heartbeat-Task der aktuellen Verbindung
    tasks: Mutex<Vec<AbortHandle>>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient
    pub fn new(server_url: String, heartbeat_interval: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(256);

        Self {
            server_url,
            username: None,
            heartbeat_interval,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: RwLock::new(None),
            event_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Setzt einen optionalen Anzeigenamen für `register`
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Verarbeitet eingehende Relay-Nachrichten
    async fn handle_relay_message(
        msg: RelayMessage,
        state: &Arc<RwLock<ClientState>>,
        event_tx: &broadcast::Sender<RelayEvent>,
        reg_tx: &mpsc::Sender<Result<String, RelayError>>,
    ) {
        match &msg {
            RelayMessage::Registered { endpoint_id } => {
                tracing::info!("Registered with endpoint_id {}", endpoint_id);
                state.write().endpoint_id = Some(endpoint_id.clone());
                let _ = reg_tx.try_send(Ok(endpoint_id.clone()));
            }

            RelayMessage::Error { code, message } => {
                tracing::error!("Relay error {}: {}", code, message);
                // Bei Registrierungs-Fehlern auch dem reg_tx melden
                if state.read().endpoint_id.is_none() {
                    let _ = reg_tx.try_send(Err(RelayError::Server {
                        code: *code,
                        message: message.clone(),
                    }));
                }
            }

            RelayMessage::Pong => {
                // Heartbeat-Response - nichts zu tun
                return;
            }

            other => {
                tracing::debug!("Relay message: {}", other.kind());
            }
        }

        let _ = event_tx.send(RelayEvent::Message(msg));
    }

    /// Startet einen Heartbeat-Task
    fn start_heartbeat(&self, tx: mpsc::Sender<String>) {
        let state = Arc::clone(&self.state);
        let period = self.heartbeat_interval;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // Erster Tick kommt sofort
            interval.tick().await;
            loop {
                interval.tick().await;
                if !state.read().is_connected {
                    tracing::debug!("Heartbeat: client disconnected, stopping heartbeat task");
                    break;
                }
                let frame = match encode_frame(&ClientMessage::Heartbeat) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!("Failed to encode heartbeat: {}", e);
                        break;
                    }
                };
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
        self.tasks.lock().push(task.abort_handle());
    }

    /// Sendet `register` und wartet auf `registered`
    async fn register(
        &self,
        reg_rx: &mut mpsc::Receiver<Result<String, RelayError>>,
    ) -> Result<String, RelayError> {
        self.send(ClientMessage::Register {
            username: self.username.clone(),
        })
        .await?;

        tokio::select! {
            result = reg_rx.recv() => match result {
                Some(result) => result,
                None => Err(RelayError::RegistrationFailed("No response".to_string())),
            },
            _ = tokio::time::sleep(REGISTRATION_TIMEOUT) => {
                Err(RelayError::RegistrationFailed("Timeout".to_string()))
            }
        }
    }

    /// Baut die aktuelle Verbindung ab (Tasks, Sender, Status)
    fn teardown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.tx.write() = None;

        let mut state = self.state.write();
        state.is_connected = false;
        state.endpoint_id = None;
    }
}

#[async_trait]
impl RelayClient for SignalingClient {
    /// Verbindet mit dem Relay und registriert den Endpoint
    async fn connect(&self) -> Result<String, RelayError> {
        let ws_url = websocket_url(&self.server_url)?;

        // Alte Verbindung verwerfen
        self.teardown();

        tracing::info!("Connecting to relay: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| RelayError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        // Message-Sender erstellen
        let (tx, mut rx) = mpsc::channel::<String>(100);
        *self.tx.write() = Some(tx.clone());

        {
            let mut state = self.state.write();
            state.is_connected = true;
            state.endpoint_id = None;
        }

        let _ = self.event_tx.send(RelayEvent::Connected);

        // Channel für Registrierungs-Response
        let (reg_tx, mut reg_rx) = mpsc::channel::<Result<String, RelayError>>(1);

        // Read-Task starten
        let state_clone = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();

        let read_task = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RelayMessage>(&text) {
                        Ok(relay_msg) => {
                            Self::handle_relay_message(relay_msg, &state_clone, &event_tx, &reg_tx)
                                .await;
                        }
                        Err(e) => tracing::warn!("Dropping unparseable relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            // Disconnect-Status setzen
            state_clone.write().is_connected = false;
            let _ = event_tx.send(RelayEvent::Disconnected);
        });

        // Write-Task starten
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        {
            let mut tasks = self.tasks.lock();
            tasks.push(read_task.abort_handle());
            tasks.push(write_task.abort_handle());
        }

        match self.register(&mut reg_rx).await {
            Ok(endpoint_id) => {
                self.start_heartbeat(tx);
                Ok(endpoint_id)
            }
            Err(e) => {
                tracing::warn!("Registration failed: {}", e);
                self.teardown();
                Err(e)
            }
        }
    }

    /// Sendet eine Nachricht (non-blocking, verwendet try_send)
    async fn send(&self, message: ClientMessage) -> Result<(), RelayError> {
        let tx = self.tx.read().clone().ok_or(RelayError::NotConnected)?;

        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }

        tracing::debug!("-> relay: {}", message.kind());

        let frame = encode_frame(&message)?;
        tx.try_send(frame)
            .map_err(|e| RelayError::SendFailed(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.event_tx.subscribe()
    }

    fn endpoint_id(&self) -> Option<String> {
        self.state.read().endpoint_id.clone()
    }

    fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url)
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Leitet die WebSocket-URL (`/ws`) aus der Relay-URL ab
fn websocket_url(server_url: &str) -> Result<Url, RelayError> {
    let mut url =
        Url::parse(server_url).map_err(|e| RelayError::ConnectionFailed(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(RelayError::ConnectionFailed(format!(
                "unsupported scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| RelayError::ConnectionFailed(format!("cannot use scheme {}", scheme)))?;

    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

/// Serialisiert eine Nachricht und fügt den Timestamp hinzu
fn encode_frame(message: &ClientMessage) -> Result<String, RelayError> {
    let mut value =
        serde_json::to_value(message).map_err(|e| RelayError::SendFailed(e.to_string()))?;

    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "timestamp".to_string(),
            serde_json::Value::Number(Utc::now().timestamp_millis().into()),
        );
    }

    serde_json::to_string(&value).map_err(|e| RelayError::SendFailed(e.to_string()))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Lokaler Relay, der auf `register` mit `reply` antwortet
    async fn local_relay(reply: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            if let Some(Ok(Message::Text(_))) = ws.next().await {
                ws.send(Message::Text(reply.to_string())).await.unwrap();
            }
            while let Some(Ok(_)) = ws.next().await {}
        });

        format!("http://{}", addr)
    }

    #[test]
    fn test_websocket_url_from_https() {
        let url = websocket_url("https://relay.example.com").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com/ws");
    }

    #[test]
    fn test_websocket_url_keeps_base_path() {
        let url = websocket_url("http://localhost:3000/signal/").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:3000/signal/ws");
    }

    #[test]
    fn test_websocket_url_rejects_unknown_scheme() {
        assert!(matches!(
            websocket_url("ftp://relay.example.com"),
            Err(RelayError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn test_encode_frame_adds_timestamp() {
        let frame = encode_frame(&ClientMessage::Hangup {
            session_id: SessionId::from("s-1"),
            to: "bob".to_string(),
        })
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "hangup");
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_registration_error_resets_connection() {
        let url = local_relay(r#"{"type":"error","code":409,"message":"name taken"}"#).await;
        let client = SignalingClient::new(url, Duration::from_secs(25));

        let result = client.connect().await;

        assert!(matches!(result, Err(RelayError::Server { code: 409, .. })));
        assert!(!client.is_connected());
        assert_eq!(client.endpoint_id(), None);
        assert!(matches!(
            client.send(ClientMessage::Heartbeat).await,
            Err(RelayError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_registration_succeeds() {
        let url = local_relay(r#"{"type":"registered","endpointId":"ep-1"}"#).await;
        let client = SignalingClient::new(url, Duration::from_secs(25));

        let endpoint_id = client.connect().await.unwrap();

        assert_eq!(endpoint_id, "ep-1");
        assert!(client.is_connected());
        assert_eq!(client.endpoint_id(), Some("ep-1".to_string()));
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let client = SignalingClient::new("http://localhost:3000".to_string(), Duration::from_secs(25));

        let result = client.send(ClientMessage::Heartbeat).await;
        assert!(matches!(result, Err(RelayError::NotConnected)));
        assert!(!client.is_connected());
        assert_eq!(client.endpoint_id(), None);
    }
}
