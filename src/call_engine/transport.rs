//! Media Transport
//!
//! Opake Transport-Fähigkeit hinter dem Session Negotiator. Die
//! Produktions-Implementierung nutzt eine WebRTC Peer Connection.

use super::media::{MediaKind, MediaTrack};
use crate::config::IceServerConfig;
use crate::signaling::{Candidate, DescriptionKind, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

/// Sample Rate für Opus (48kHz)
pub const AUDIO_CLOCK_RATE: u32 = 48000;

/// RTP Clock Rate für Video
pub const VIDEO_CLOCK_RATE: u32 = 90000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Transport closed")]
    Closed,
}

// ============================================================================
// TRANSPORT EVENTS
// ============================================================================

/// Konnektivitätszustand des Transports
///
/// Nicht monoton: nach `Connected` kann wieder `Checking` oder
/// `Disconnected` folgen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for ConnectivityState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Self::New,
            RTCPeerConnectionState::Connecting => Self::Checking,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Neuer lokaler Candidate, muss sofort an die Gegenseite
    LocalCandidate(Candidate),
    ConnectivityChanged(ConnectivityState),
}

// ============================================================================
// TRANSPORT TRAITS
// ============================================================================

/// Opake Fähigkeit: Descriptions erzeugen/übernehmen, Candidates hinzufügen
#[async_trait]
pub trait MediaTransport: Send + 'static {
    async fn add_track(&mut self, track: &MediaTrack) -> Result<(), TransportError>;

    async fn create_offer(&mut self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), TransportError>;

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_candidate(&mut self, candidate: &Candidate) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Erzeugt pro Session einen frischen Transport
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: MediaTransport;

    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self::Transport, TransportError>;
}

// ============================================================================
// WEBRTC TRANSPORT
// ============================================================================

/// Erzeugt [`RtcTransport`]s mit den konfigurierten STUN/TURN Servern
#[derive(Debug, Clone)]
pub struct RtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: &[IceServerConfig]) -> Self {
        let ice_servers = ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        Self { ice_servers }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    type Transport = RtcTransport;

    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<RtcTransport, TransportError> {
        // Media Engine mit Standard-Codecs (Opus, VP8, ...)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);

        RtcTransport::register_handlers(&pc, events);

        Ok(RtcTransport { pc, closed: false })
    }
}

/// WebRTC Peer Connection als [`MediaTransport`]
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    closed: bool,
}

impl RtcTransport {
    /// Registriert Event Handler für die Peer Connection
    fn register_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<TransportEvent>) {
        let state_tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);
            let _ = state_tx.send(TransportEvent::ConnectivityChanged(s.into()));
            Box::pin(async {})
        }));

        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = events.send(TransportEvent::LocalCandidate(Candidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        pc.on_track(Box::new(move |track, _, _| {
            Box::pin(async move {
                tracing::info!("Received remote track: {:?}", track.codec());
            })
        }));
    }

    fn to_rtc(description: &SessionDescription) -> Result<RTCSessionDescription, TransportError> {
        let result = match description.kind {
            DescriptionKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
            DescriptionKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
        };
        result.map_err(|e| TransportError::InvalidSdp(e.to_string()))
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaTransport for RtcTransport {
    async fn add_track(&mut self, track: &MediaTrack) -> Result<(), TransportError> {
        self.ensure_open()?;

        let capability = match track.kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: AUDIO_CLOCK_RATE,
                channels: 1,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
        };

        let local_track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            track.id.clone(),
            "ringr".to_string(),
        ));

        self.pc
            .add_track(local_track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_err)?;

        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let description = Self::to_rtc(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(webrtc_err)
    }

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let description = Self::to_rtc(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(webrtc_err)
    }

    async fn add_candidate(&mut self, candidate: &Candidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc.add_ice_candidate(init).await.map_err(webrtc_err)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pc.close().await.map_err(webrtc_err)
    }
}

fn webrtc_err(e: webrtc::Error) -> TransportError {
    TransportError::WebRtc(e.to_string())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_connection_state_mapping() {
        assert_eq!(
            ConnectivityState::from(RTCPeerConnectionState::Connecting),
            ConnectivityState::Checking
        );
        assert_eq!(
            ConnectivityState::from(RTCPeerConnectionState::Unspecified),
            ConnectivityState::New
        );
        assert_eq!(
            ConnectivityState::from(RTCPeerConnectionState::Failed),
            ConnectivityState::Failed
        );
    }

    #[test]
    fn test_factory_maps_ice_servers() {
        let factory = RtcTransportFactory::new(&[IceServerConfig {
            urls: vec!["turn:turn.example.com:3478".to_string()],
            username: Some("user".to_string()),
            credential: Some("secret".to_string()),
        }]);

        assert_eq!(factory.ice_servers.len(), 1);
        assert_eq!(factory.ice_servers[0].username, "user");
        assert_eq!(factory.ice_servers[0].credential, "secret");
    }
}
