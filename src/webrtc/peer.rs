//! webrtc-rs implementation of the relay's media-engine seam

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::config::{IceServer, WebRtcConfig};
use super::engine::{PeerEngine, RelayPeer, SampleSink};
use super::signaling::{ConnectionState, IceCandidate};
use crate::error::{AppError, Result};
use crate::video::{VideoCodec, VideoFrame};

/// Stream ID advertised for relayed tracks
const RELAY_STREAM_ID: &str = "go2-bridge";

/// Peer-connection factory backed by webrtc-rs
pub struct WebRtcEngine {
    api: API,
    ice_servers: Vec<IceServer>,
}

impl WebRtcEngine {
    /// Create the engine with default codecs and interceptors
    pub fn new(config: &WebRtcConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: config.ice_servers(),
        })
    }

    /// ICE servers every peer is created with
    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    async fn build_peer(&self, connection_id: &str, codec: VideoCodec) -> Result<WebRtcPeer> {
        let rtc_config = RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = self.api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;
        let pc = Arc::new(pc);

        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        let state_tx = Arc::new(state_tx);
        let id = connection_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state_tx = state_tx.clone();
            let id = id.clone();

            Box::pin(async move {
                let new_state = match s {
                    RTCPeerConnectionState::New => ConnectionState::New,
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    _ => return,
                };

                info!("Relay connection {} transport state: {}", id, new_state);
                let _ = state_tx.send(new_state);
            })
        }));

        // The video track goes in before any offer is applied, so the
        // answer binds the viewer's video m-line to this sender
        let sink = sample_sink(codec, connection_id);
        let sender = pc
            .add_track(Arc::clone(&sink.track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add video track: {}", e)))?;
        spawn_rtcp_reader(sender.clone(), connection_id.to_string());

        Ok(WebRtcPeer {
            connection_id: connection_id.to_string(),
            pc,
            state_rx,
            video: Mutex::new(OutboundVideo { sender, sink }),
        })
    }
}

#[async_trait]
impl PeerEngine for WebRtcEngine {
    async fn create_peer(
        &self,
        connection_id: &str,
        codec: VideoCodec,
    ) -> Result<Arc<dyn RelayPeer>> {
        let peer = self.build_peer(connection_id, codec).await?;
        Ok(Arc::new(peer))
    }
}

fn sample_sink(codec: VideoCodec, connection_id: &str) -> Arc<StaticSampleSink> {
    let track = Arc::new(TrackLocalStaticSample::new(
        codec.capability(),
        format!("video-{}", connection_id),
        RELAY_STREAM_ID.to_string(),
    ));
    Arc::new(StaticSampleSink { codec, track })
}

/// Drain RTCP so the interceptors keep running
fn spawn_rtcp_reader(sender: Arc<RTCRtpSender>, connection_id: String) {
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while sender.read(&mut rtcp_buf).await.is_ok() {}
        debug!("RTCP reader for {} stopped", connection_id);
    });
}

struct OutboundVideo {
    sender: Arc<RTCRtpSender>,
    sink: Arc<StaticSampleSink>,
}

/// One browser-facing RTCPeerConnection
struct WebRtcPeer {
    connection_id: String,
    pc: Arc<RTCPeerConnection>,
    state_rx: watch::Receiver<ConnectionState>,
    video: Mutex<OutboundVideo>,
}

#[async_trait]
impl RelayPeer for WebRtcPeer {
    fn video_sink(&self) -> Arc<dyn SampleSink> {
        self.video.lock().sink.clone()
    }

    async fn replace_video(&self, codec: VideoCodec) -> Result<Arc<dyn SampleSink>> {
        let sender = self.video.lock().sender.clone();
        let sink = sample_sink(codec, &self.connection_id);

        sender
            .replace_track(Some(
                Arc::clone(&sink.track) as Arc<dyn TrackLocal + Send + Sync>
            ))
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to replace video track: {}", e)))?;

        info!(
            "Relay connection {} video track now carries {}",
            self.connection_id, codec
        );
        self.video.lock().sink = sink.clone();
        Ok(sink)
    }

    async fn apply_offer(&self, offer_sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| AppError::WebRtcError(format!("Invalid SDP offer: {}", e)))?;

        self.pc.set_remote_description(offer).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to set remote description: {}", e))
        })?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create answer: {}", e)))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set local description: {}", e)))?;

        // Prefer the local description: it carries candidates gathered so far
        let sdp = self
            .pc
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .unwrap_or(answer.sdp);
        Ok(sdp)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add ICE candidate: {}", e)))
    }

    fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}

/// Outbound sample track; webrtc-rs packetizes each sample for the codec
struct StaticSampleSink {
    codec: VideoCodec,
    track: Arc<TrackLocalStaticSample>,
}

#[async_trait]
impl SampleSink for StaticSampleSink {
    fn codec(&self) -> VideoCodec {
        self.codec
    }

    async fn write_frame(&self, frame: &VideoFrame) -> Result<()> {
        self.track
            .write_sample(&Sample {
                data: frame.data_bytes(),
                duration: frame.duration,
                ..Default::default()
            })
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to write sample: {}", e)))
    }
}
