//! Channel-driven fakes for the robot link and media engine seams

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

use crate::config::{AppConfig, ConfigStore};
use crate::error::{AppError, Result};
use crate::robot::{RobotConnector, RobotLink, RobotTarget, RobotTelemetry};
use crate::state::AppState;
use crate::video::{FrameTranscoder, MediaTrack, TranscoderFactory, VideoCodec, VideoFrame};
use crate::webrtc::{ConnectionState, IceCandidate, PeerEngine, RelayPeer, SampleSink};

/// H.264 key-frame sample whose payload is `sample-<seq>`
pub fn frame(seq: u64) -> VideoFrame {
    VideoFrame::new(
        Bytes::from(format!("sample-{}", seq)),
        VideoCodec::H264,
        Duration::from_millis(33),
        seq,
    )
    .with_key_frame(true)
}

/// Track fed through an mpsc sender; ends when every sender is dropped
pub struct ChannelTrack {
    id: String,
    codec: VideoCodec,
    rx: tokio::sync::Mutex<mpsc::Receiver<VideoFrame>>,
}

impl ChannelTrack {
    pub fn new(id: &str) -> (Arc<dyn MediaTrack>, mpsc::Sender<VideoFrame>) {
        Self::with_codec(id, VideoCodec::H264)
    }

    pub fn with_codec(
        id: &str,
        codec: VideoCodec,
    ) -> (Arc<dyn MediaTrack>, mpsc::Sender<VideoFrame>) {
        let (tx, rx) = mpsc::channel(16);
        let track = Arc::new(Self {
            id: id.to_string(),
            codec,
            rx: tokio::sync::Mutex::new(rx),
        });
        (track, tx)
    }
}

#[async_trait]
impl MediaTrack for ChannelTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn codec(&self) -> VideoCodec {
        self.codec
    }

    async fn recv(&self) -> Option<VideoFrame> {
        self.rx.lock().await.recv().await
    }
}

/// Transcoder that publishes the sample payload unchanged
pub fn passthrough_transcoders() -> TranscoderFactory {
    struct Passthrough;

    impl FrameTranscoder for Passthrough {
        fn transcode(&mut self, frame: &VideoFrame) -> Result<Option<Bytes>> {
            Ok(Some(frame.data_bytes()))
        }
    }

    Arc::new(|_codec| Ok(Box::new(Passthrough) as Box<dyn FrameTranscoder>))
}

// ============================================================================
// Media engine
// ============================================================================

/// Engine whose peers answer `answer:<id>:<offer>` and reject offers
/// containing "bad". Like the real engine, every peer has its outbound
/// sender from creation.
#[derive(Default)]
pub struct FakeEngine {
    peers: Mutex<HashMap<String, Arc<FakePeer>>>,
    created: AtomicUsize,
}

impl FakeEngine {
    /// Latest peer built for `id`
    pub fn peer(&self, id: &str) -> Option<Arc<FakePeer>> {
        self.peers.lock().get(id).cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerEngine for FakeEngine {
    async fn create_peer(
        &self,
        connection_id: &str,
        codec: VideoCodec,
    ) -> Result<Arc<dyn RelayPeer>> {
        let (state_tx, _) = watch::channel(ConnectionState::New);
        let peer = Arc::new(FakePeer {
            id: connection_id.to_string(),
            sinks: Mutex::new(vec![FakeSink::new(codec)]),
            negotiated: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            offers: AtomicUsize::new(0),
            in_offer: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            state_tx,
        });
        self.created.fetch_add(1, Ordering::SeqCst);
        self.peers
            .lock()
            .insert(connection_id.to_string(), peer.clone());
        Ok(peer)
    }
}

pub struct FakePeer {
    id: String,
    /// Every sender track the peer has had, current one last
    sinks: Mutex<Vec<Arc<FakeSink>>>,
    /// Sender current when the last answer was produced
    negotiated: Mutex<Option<Arc<FakeSink>>>,
    candidates: Mutex<Vec<String>>,
    offers: AtomicUsize,
    in_offer: AtomicBool,
    overlapped: AtomicBool,
    closed: AtomicBool,
    state_tx: watch::Sender<ConnectionState>,
}

impl FakePeer {
    pub fn sink_count(&self) -> usize {
        self.sinks.lock().len()
    }

    pub fn negotiated_sink(&self) -> Option<Arc<FakeSink>> {
        self.negotiated.lock().clone()
    }

    fn current_sink(&self) -> Arc<FakeSink> {
        let sinks = self.sinks.lock();
        sinks[sinks.len() - 1].clone()
    }

    pub fn sink(&self, index: usize) -> Option<Arc<FakeSink>> {
        self.sinks.lock().get(index).cloned()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.candidates.lock().clone()
    }

    pub fn offer_count(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn saw_overlapping_offers(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_transport_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send_replace(state);
    }
}

#[async_trait]
impl RelayPeer for FakePeer {
    fn video_sink(&self) -> Arc<dyn SampleSink> {
        self.current_sink()
    }

    async fn replace_video(&self, codec: VideoCodec) -> Result<Arc<dyn SampleSink>> {
        let sink = FakeSink::new(codec);
        self.sinks.lock().push(sink.clone());
        Ok(sink)
    }

    async fn apply_offer(&self, offer_sdp: &str) -> Result<String> {
        if self.in_offer.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.in_offer.store(false, Ordering::SeqCst);
        self.offers.fetch_add(1, Ordering::SeqCst);

        if offer_sdp.contains("bad") {
            return Err(AppError::WebRtcError("unparsable offer".to_string()));
        }
        *self.negotiated.lock() = Some(self.current_sink());
        Ok(format!("answer:{}:{}", self.id, offer_sdp))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if candidate.candidate.contains("bad") {
            return Err(AppError::WebRtcError("invalid candidate".to_string()));
        }
        self.candidates.lock().push(candidate.candidate);
        Ok(())
    }

    fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.state_tx.send_replace(ConnectionState::Closed);
        Ok(())
    }
}

/// Records the sequence numbers written to it
pub struct FakeSink {
    codec: VideoCodec,
    tx: mpsc::UnboundedSender<u64>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<u64>>,
    broken: AtomicBool,
}

impl FakeSink {
    fn new(codec: VideoCodec) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            codec,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            broken: AtomicBool::new(false),
        })
    }

    /// Next written sequence, waiting at most `wait`
    pub async fn next(&self, wait: Duration) -> Option<u64> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(wait, rx.recv()).await.ok().flatten()
    }

    /// Make every further write fail
    pub fn break_sender(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SampleSink for FakeSink {
    fn codec(&self) -> VideoCodec {
        self.codec
    }

    async fn write_frame(&self, frame: &VideoFrame) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(AppError::WebRtcError("sender gone".to_string()));
        }
        let _ = self.tx.send(frame.sequence);
        Ok(())
    }
}

// ============================================================================
// Robot link
// ============================================================================

/// Connector handing out channel-fed links
#[derive(Default)]
pub struct FakeConnector {
    delay: Option<Duration>,
    fail: bool,
    attempts: AtomicUsize,
    last_target: Mutex<Option<RobotTarget>>,
    feed: Mutex<Option<mpsc::Sender<VideoFrame>>>,
    telemetry: Mutex<Option<broadcast::Sender<RobotTelemetry>>>,
    link_connected: Mutex<Option<Arc<AtomicBool>>>,
}

impl FakeConnector {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn last_target(&self) -> Option<RobotTarget> {
        self.last_target.lock().clone()
    }

    /// Sender feeding the latest link's video track
    pub fn feed(&self) -> Option<mpsc::Sender<VideoFrame>> {
        self.feed.lock().clone()
    }

    /// Simulate the robot going away: the latest track ends
    pub fn drop_feed(&self) {
        self.feed.lock().take();
    }

    /// Publish a state report on the latest link. Returns how many
    /// subscribers saw it.
    pub fn publish_telemetry(&self, topic: &str, data: serde_json::Value) -> usize {
        let report = RobotTelemetry {
            topic: topic.to_string(),
            data,
        };
        self.telemetry
            .lock()
            .as_ref()
            .and_then(|tx| tx.send(report).ok())
            .unwrap_or(0)
    }

    /// Whether the latest link was told to disconnect
    pub fn link_disconnected(&self) -> bool {
        self.link_connected
            .lock()
            .as_ref()
            .map(|flag| !flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

#[async_trait]
impl RobotConnector for FakeConnector {
    async fn connect(&self, target: &RobotTarget) -> Result<Box<dyn RobotLink>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        *self.last_target.lock() = Some(target.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(AppError::RobotLink("robot unreachable".to_string()));
        }

        let (track, feed) = ChannelTrack::new("robot-video");
        let connected = Arc::new(AtomicBool::new(true));
        let (telemetry, _) = broadcast::channel(16);
        *self.feed.lock() = Some(feed);
        *self.telemetry.lock() = Some(telemetry.clone());
        *self.link_connected.lock() = Some(connected.clone());

        Ok(Box::new(FakeLink {
            track,
            telemetry,
            connected,
        }))
    }
}

struct FakeLink {
    track: Arc<dyn MediaTrack>,
    telemetry: broadcast::Sender<RobotTelemetry>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl RobotLink for FakeLink {
    fn video_track(&self) -> Arc<dyn MediaTrack> {
        self.track.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn telemetry(&self) -> Option<broadcast::Receiver<RobotTelemetry>> {
        Some(self.telemetry.subscribe())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// App state over fakes with default configuration
pub fn test_state() -> (Arc<AppState>, Arc<FakeConnector>, Arc<FakeEngine>) {
    test_state_with(FakeConnector::default())
}

pub fn test_state_with(
    connector: FakeConnector,
) -> (Arc<AppState>, Arc<FakeConnector>, Arc<FakeEngine>) {
    let connector = Arc::new(connector);
    let engine = Arc::new(FakeEngine::default());
    let (shutdown_tx, _) = broadcast::channel(1);
    let state = AppState::new(
        ConfigStore::new(PathBuf::from("go2-bridge-test.json"), AppConfig::default()),
        engine.clone(),
        connector.clone(),
        passthrough_transcoders(),
        shutdown_tx,
    );
    (state, connector, engine)
}
