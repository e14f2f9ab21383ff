use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::ConfigStore;
use crate::control::ControlSession;
use crate::robot::{RobotConnector, RobotSession};
use crate::video::{FrameBroadcaster, TranscoderFactory};
use crate::webrtc::{MediaRelay, PeerEngine};

/// Application-wide state shared across handlers
///
/// # Video paths
///
/// - `robot` owns the robot link and feeds both paths on connect
/// - `relay` serves browser viewers over WebRTC, without re-encoding
/// - `broadcaster` holds the latest JPEG for `/ws/video` push sockets
pub struct AppState {
    /// Configuration store
    pub config: ConfigStore,
    /// Latest-frame slot for push viewers
    pub broadcaster: Arc<FrameBroadcaster>,
    /// WebRTC viewer relay
    pub relay: Arc<MediaRelay>,
    /// Robot connection lifecycle
    pub robot: Arc<RobotSession>,
    /// The single UI control channel
    pub control: Arc<ControlSession>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: ConfigStore,
        engine: Arc<dyn PeerEngine>,
        connector: Arc<dyn RobotConnector>,
        transcoders: TranscoderFactory,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        let broadcaster = Arc::new(FrameBroadcaster::new());
        let relay = Arc::new(MediaRelay::new(engine, config.get().robot.codec));
        let control = Arc::new(ControlSession::new());
        let robot = RobotSession::new(
            connector,
            broadcaster.clone(),
            relay.clone(),
            control.clone(),
            transcoders,
        );

        Arc::new(Self {
            config,
            broadcaster,
            relay,
            robot,
            control,
            shutdown_tx,
        })
    }

    /// Subscribe to shutdown signal
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Disconnect the robot and close every viewer connection
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.robot.disconnect().await;
        self.relay.close_all().await;
    }
}
