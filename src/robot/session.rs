//! Robot session lifecycle
//!
//! `Disconnected -> Connecting -> Connected -> Disconnected`
//!
//! At most one robot link exists at a time. On a successful connect the
//! UI is told first, then the link's video track is wired into both the
//! relay (encoded samples) and the frame broadcaster (transcoded frames).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::link::{RobotConnector, RobotLink, RobotTarget, RobotTelemetry};
use crate::control::{ControlSession, ServerMessage};
use crate::error::{AppError, Result};
use crate::utils::LogThrottle;
use crate::video::{FrameBroadcaster, TrackFanout, TranscoderFactory};
use crate::webrtc::MediaRelay;

/// Robot connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
        }
    }
}

/// Robot status for the HTTP API
#[derive(Debug, Clone, Serialize)]
pub struct RobotStatus {
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<RobotTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_since: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_track: Option<String>,
    /// Consumers of the upstream fanout (frame producer plus relay forwarders)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_subscribers: Option<usize>,
    pub frames_published: u64,
}

/// Everything owned by one live link
struct ActiveLink {
    link: Box<dyn RobotLink>,
    fanout: Arc<TrackFanout>,
    cancel: CancellationToken,
    producer: Option<JoinHandle<()>>,
    /// Set while telemetry is forwarded to the control channel
    telemetry: Option<CancellationToken>,
    generation: u64,
}

#[derive(Clone)]
struct LinkInfo {
    target: RobotTarget,
    connected_since: DateTime<Utc>,
    fanout: Arc<TrackFanout>,
}

/// Owns the robot link and wires its video into the viewers
pub struct RobotSession {
    me: Weak<RobotSession>,
    connector: Arc<dyn RobotConnector>,
    broadcaster: Arc<FrameBroadcaster>,
    relay: Arc<MediaRelay>,
    control: Arc<ControlSession>,
    transcoders: TranscoderFactory,
    /// Held across a whole connect/disconnect, serializing them
    active: Mutex<Option<ActiveLink>>,
    info: parking_lot::RwLock<Option<LinkInfo>>,
    state: watch::Sender<SessionState>,
    generation: AtomicU64,
}

impl RobotSession {
    pub fn new(
        connector: Arc<dyn RobotConnector>,
        broadcaster: Arc<FrameBroadcaster>,
        relay: Arc<MediaRelay>,
        control: Arc<ControlSession>,
        transcoders: TranscoderFactory,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            connector,
            broadcaster,
            relay,
            control,
            transcoders,
            active: Mutex::new(None),
            info: parking_lot::RwLock::new(None),
            state,
            generation: AtomicU64::new(0),
        })
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Status snapshot
    pub fn status(&self) -> RobotStatus {
        let info = self.info.read().clone();
        RobotStatus {
            state: self.state(),
            target: info.as_ref().map(|i| i.target.redacted()),
            connected_since: info.as_ref().map(|i| i.connected_since),
            upstream_track: info.as_ref().map(|i| i.fanout.track_id().to_string()),
            upstream_subscribers: info.map(|i| i.fanout.subscriber_count()),
            frames_published: self.broadcaster.published_count(),
        }
    }

    /// Connect to `target`, bounded by `timeout`. Already connected only
    /// restates `robot_state` to the UI; on failure the session is back in `Disconnected` with nothing
    /// wired to the viewers.
    pub async fn connect(&self, target: RobotTarget, timeout: Duration) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            debug!("Robot already connected, ignoring connect");
            self.control.notify(ServerMessage::RobotState { connected: true });
            return Ok(());
        }

        target.validate()?;

        self.set_state(SessionState::Connecting);
        info!("Connecting to robot {} (timeout {:?})", target, timeout);

        let link = match tokio::time::timeout(timeout, self.connector.connect(&target)).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                warn!("Robot connect to {} failed: {}", target, e);
                self.set_state(SessionState::Disconnected);
                return Err(e);
            }
            Err(_) => {
                warn!("Robot connect to {} timed out after {:?}", target, timeout);
                self.set_state(SessionState::Disconnected);
                return Err(AppError::Timeout(format!(
                    "robot connect did not complete within {:?}",
                    timeout
                )));
            }
        };

        if !link.is_connected() {
            link.disconnect().await;
            self.set_state(SessionState::Disconnected);
            return Err(AppError::RobotLink(
                "robot link closed during connect".to_string(),
            ));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(SessionState::Connected);
        self.control.notify(ServerMessage::RobotState { connected: true });

        // Video is wired only after the UI has been told
        let fanout = TrackFanout::start(link.video_track());
        let cancel = CancellationToken::new();
        let producer = self.spawn_frame_producer(&fanout, cancel.clone());
        self.relay.set_upstream_track(fanout.clone()).await;
        self.spawn_link_watch(fanout.clone(), cancel.clone(), generation);

        *self.info.write() = Some(LinkInfo {
            target: target.clone(),
            connected_since: Utc::now(),
            fanout: fanout.clone(),
        });
        *active = Some(ActiveLink {
            link,
            fanout,
            cancel,
            producer: Some(producer),
            telemetry: None,
            generation,
        });

        info!("Robot {} connected", target);
        Ok(())
    }

    /// Tear down the link if present. Idempotent; when already disconnected
    /// only `robot_state` is restated.
    pub async fn disconnect(&self) {
        let mut active = self.active.lock().await;
        let link = match active.take() {
            Some(link) => link,
            None => {
                debug!("Robot already disconnected");
                self.control.notify(ServerMessage::RobotState { connected: false });
                return;
            }
        };

        self.teardown(link).await;
        self.finish_disconnect();
        info!("Robot disconnected");
    }

    /// Start or stop forwarding the robot's state reports to the control
    /// channel. Forwarding ends with the link.
    pub async fn set_telemetry(&self, enabled: bool) -> Result<()> {
        let mut active = self.active.lock().await;
        let current = match active.as_mut() {
            Some(current) => current,
            None if !enabled => return Ok(()),
            None => return Err(AppError::RobotLink("robot is not connected".to_string())),
        };

        if !enabled {
            if let Some(token) = current.telemetry.take() {
                token.cancel();
                info!("Robot telemetry forwarding stopped");
            }
            return Ok(());
        }
        if current.telemetry.is_some() {
            return Ok(());
        }

        let reports = current.link.telemetry().ok_or_else(|| {
            AppError::RobotLink("robot link does not carry telemetry".to_string())
        })?;
        let token = current.cancel.child_token();
        spawn_telemetry_forwarder(reports, self.control.clone(), token.clone());
        current.telemetry = Some(token);
        info!("Robot telemetry forwarding started");
        Ok(())
    }

    async fn handle_link_loss(&self, generation: u64) {
        let mut active = self.active.lock().await;
        let current = active.as_ref().map(|link| link.generation);
        if current != Some(generation) {
            return;
        }
        if let Some(link) = active.take() {
            warn!("Robot link lost");
            self.teardown(link).await;
            self.finish_disconnect();
        }
    }

    /// Stop production deterministically, then close the link
    async fn teardown(&self, mut active: ActiveLink) {
        active.cancel.cancel();
        active.fanout.stop();
        if let Some(producer) = active.producer.take() {
            if let Err(e) = producer.await {
                warn!("Frame producer ended abnormally: {}", e);
            }
        }
        active.link.disconnect().await;
    }

    fn finish_disconnect(&self) {
        // Viewers keep their connections; they just stop receiving
        self.relay.clear_upstream_track();
        *self.info.write() = None;
        self.set_state(SessionState::Disconnected);
        self.control.notify(ServerMessage::RobotState { connected: false });
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Robot session {} -> {}", previous, state);
        }
    }

    /// Transcode the upstream into the broadcaster on a blocking worker
    fn spawn_frame_producer(
        &self,
        fanout: &TrackFanout,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let mut subscription = fanout.subscribe();
        let codec = fanout.codec();
        let factory = self.transcoders.clone();
        let broadcaster = self.broadcaster.clone();

        tokio::task::spawn_blocking(move || {
            // Decoder state is not Send; it lives and dies on this thread
            let mut transcoder = match factory(codec) {
                Ok(transcoder) => transcoder,
                Err(e) => {
                    warn!("Push video disabled for {}: {}", codec, e);
                    return;
                }
            };

            let mut published = 0u64;
            let mut failed = 0u64;
            let mut failure_log = LogThrottle::with_secs(5);
            while !cancel.is_cancelled() {
                let frame = match subscription.blocking_recv() {
                    Some(frame) => frame,
                    None => break,
                };
                if cancel.is_cancelled() {
                    break;
                }
                match transcoder.transcode(&frame) {
                    Ok(Some(image)) => {
                        broadcaster.publish(image);
                        published += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        failed += 1;
                        match failure_log.check() {
                            Some(0) => warn!("Frame transcode failed: {}", e),
                            Some(skipped) => {
                                warn!("Frame transcode failed: {} ({} more suppressed)", e, skipped)
                            }
                            None => trace!("Frame transcode failed: {}", e),
                        }
                    }
                }
            }

            info!(
                "Frame producer stopped ({} published, {} failed)",
                published, failed
            );
        })
    }

    /// Turn the upstream ending on its own into a disconnect
    fn spawn_link_watch(&self, fanout: Arc<TrackFanout>, cancel: CancellationToken, generation: u64) {
        let session = self.me.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = fanout.ended() => {
                    if let Some(session) = session.upgrade() {
                        session.handle_link_loss(generation).await;
                    }
                }
            }
        });
    }
}

fn spawn_telemetry_forwarder(
    mut reports: broadcast::Receiver<RobotTelemetry>,
    control: Arc<ControlSession>,
    stop: CancellationToken,
) {
    tokio::spawn(async move {
        let mut forwarded = 0u64;
        loop {
            tokio::select! {
                biased;

                _ = stop.cancelled() => break,
                report = reports.recv() => {
                    match report {
                        Ok(report) => {
                            forwarded += 1;
                            control.notify(ServerMessage::RobotTelemetry {
                                topic: report.topic,
                                data: report.data,
                            });
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            trace!("Telemetry forwarder skipped {} reports", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        debug!("Telemetry forwarder stopped after {} reports", forwarded);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{passthrough_transcoders, FakeConnector, FakeEngine};
    use crate::video::VideoCodec;
    use bytes::Bytes;

    struct Harness {
        session: Arc<RobotSession>,
        connector: Arc<FakeConnector>,
        broadcaster: Arc<FrameBroadcaster>,
        relay: Arc<MediaRelay>,
        control: Arc<ControlSession>,
    }

    fn harness(connector: FakeConnector) -> Harness {
        let connector = Arc::new(connector);
        let broadcaster = Arc::new(FrameBroadcaster::new());
        let relay = Arc::new(MediaRelay::new(
            Arc::new(FakeEngine::default()),
            VideoCodec::H264,
        ));
        let control = Arc::new(ControlSession::new());
        let session = RobotSession::new(
            connector.clone(),
            broadcaster.clone(),
            relay.clone(),
            control.clone(),
            passthrough_transcoders(),
        );
        Harness {
            session,
            connector,
            broadcaster,
            relay,
            control,
        }
    }

    #[tokio::test]
    async fn test_connect_end_to_end() {
        let h = harness(FakeConnector::default());
        let mut channel = h.control.attach();

        h.session
            .connect(RobotTarget::LocalAp, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(h.session.state(), SessionState::Connected);

        let notified = channel.rx.recv().await.unwrap();
        assert_eq!(notified, ServerMessage::RobotState { connected: true });
        assert_eq!(h.relay.upstream_generation(), 1);

        let feed = h.connector.feed().unwrap();
        feed.send(crate::test_support::frame(1)).await.unwrap();

        let payload = h.broadcaster.get_frame(Some(Duration::from_secs(1))).await;
        assert_eq!(payload, Some(Bytes::from_static(b"sample-1")));
    }

    #[tokio::test]
    async fn test_connect_twice_is_single_attempt() {
        let h = harness(FakeConnector::default());
        h.session
            .connect(RobotTarget::LocalAp, Duration::from_secs(1))
            .await
            .unwrap();
        h.session
            .connect(RobotTarget::LocalAp, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(h.connector.attempts(), 1);
        assert_eq!(h.relay.upstream_generation(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_connects_are_serialized() {
        let h = harness(FakeConnector::with_delay(Duration::from_millis(50)));
        let a = {
            let session = h.session.clone();
            tokio::spawn(async move {
                session
                    .connect(RobotTarget::LocalAp, Duration::from_secs(1))
                    .await
            })
        };
        let b = {
            let session = h.session.clone();
            tokio::spawn(async move {
                session
                    .connect(RobotTarget::LocalAp, Duration::from_secs(1))
                    .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(h.connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_connect_timeout_leaves_nothing_behind() {
        let h = harness(FakeConnector::with_delay(Duration::from_secs(5)));
        let mut channel = h.control.attach();

        let err = h
            .session
            .connect(RobotTarget::LocalAp, Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Timeout(_)));
        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert_eq!(h.relay.upstream_generation(), 0);
        assert!(!h.relay.has_upstream());
        assert!(h.broadcaster.latest().is_none());
        assert!(channel.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_target_fails_without_attempt() {
        let h = harness(FakeConnector::default());
        let target = RobotTarget::LocalSta {
            ip: None,
            serial_number: None,
        };
        let err = h
            .session
            .connect(target, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert_eq!(h.connector.attempts(), 0);
        assert_eq!(h.session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connector_error_returns_to_disconnected() {
        let h = harness(FakeConnector::failing());
        assert!(h
            .session
            .connect(RobotTarget::LocalAp, Duration::from_secs(1))
            .await
            .is_err());
        assert_eq!(h.session.state(), SessionState::Disconnected);

        // No implicit retry
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_stops_production() {
        let h = harness(FakeConnector::default());
        h.session.disconnect().await;

        h.session
            .connect(RobotTarget::LocalAp, Duration::from_secs(1))
            .await
            .unwrap();
        let feed = h.connector.feed().unwrap();

        h.session.disconnect().await;
        h.session.disconnect().await;

        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert!(h.connector.link_disconnected());
        assert!(!h.relay.has_upstream());

        let published = h.broadcaster.published_count();
        let _ = feed.send(crate::test_support::frame(7)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.broadcaster.published_count(), published);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_upstream() {
        let h = harness(FakeConnector::default());
        h.session
            .connect(RobotTarget::LocalAp, Duration::from_secs(1))
            .await
            .unwrap();
        h.session.disconnect().await;
        h.session
            .connect(RobotTarget::from_ip("10.0.0.9"), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(h.connector.attempts(), 2);
        assert_eq!(h.relay.upstream_generation(), 2);
        assert!(h.relay.has_upstream());
    }

    #[tokio::test]
    async fn test_link_loss_returns_to_disconnected() {
        let h = harness(FakeConnector::default());
        let mut channel = h.control.attach();
        h.session
            .connect(RobotTarget::LocalAp, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            channel.rx.recv().await.unwrap(),
            ServerMessage::RobotState { connected: true }
        );

        // Robot side goes away: the track ends
        h.connector.drop_feed();

        let lost = tokio::time::timeout(Duration::from_secs(1), channel.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lost, ServerMessage::RobotState { connected: false });
        assert_eq!(h.session.state(), SessionState::Disconnected);

        // A new connect works afterwards
        h.session
            .connect(RobotTarget::LocalAp, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(h.connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_status_reports_target() {
        let h = harness(FakeConnector::default());
        assert_eq!(h.session.status().state, SessionState::Disconnected);

        h.session
            .connect(RobotTarget::from_ip("10.0.0.9"), Duration::from_secs(1))
            .await
            .unwrap();
        let status = h.session.status();
        assert_eq!(status.state, SessionState::Connected);
        assert_eq!(status.target, Some(RobotTarget::from_ip("10.0.0.9")));
        assert!(status.connected_since.is_some());
        // Only the frame producer reads the upstream while no viewer exists
        assert_eq!(status.upstream_subscribers, Some(1));

        h.session.disconnect().await;
        assert_eq!(h.session.status().upstream_subscribers, None);
    }

    #[tokio::test]
    async fn test_noop_connect_and_disconnect_restate_robot_state() {
        let h = harness(FakeConnector::default());
        let mut channel = h.control.attach();

        h.session.disconnect().await;
        assert_eq!(
            channel.rx.recv().await.unwrap(),
            ServerMessage::RobotState { connected: false }
        );

        for _ in 0..2 {
            h.session
                .connect(RobotTarget::LocalAp, Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(
                channel.rx.recv().await.unwrap(),
                ServerMessage::RobotState { connected: true }
            );
        }
        assert_eq!(h.connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_telemetry_forwarded_while_subscribed() {
        let h = harness(FakeConnector::default());
        h.session
            .connect(RobotTarget::LocalAp, Duration::from_secs(1))
            .await
            .unwrap();
        let mut channel = h.control.attach();

        h.session.set_telemetry(true).await.unwrap();
        // Subscribing twice keeps a single forwarder
        h.session.set_telemetry(true).await.unwrap();
        assert_eq!(
            h.connector
                .publish_telemetry("sport_mode_state", serde_json::json!({"mode": 1})),
            1
        );
        assert_eq!(
            channel.rx.recv().await.unwrap(),
            ServerMessage::RobotTelemetry {
                topic: "sport_mode_state".to_string(),
                data: serde_json::json!({"mode": 1}),
            }
        );

        h.session.set_telemetry(false).await.unwrap();
        h.connector
            .publish_telemetry("sport_mode_state", serde_json::json!({"mode": 2}));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(channel.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_telemetry_ends_with_link() {
        let h = harness(FakeConnector::default());
        assert!(matches!(
            h.session.set_telemetry(true).await,
            Err(AppError::RobotLink(_))
        ));
        h.session.set_telemetry(false).await.unwrap();

        h.session
            .connect(RobotTarget::LocalAp, Duration::from_secs(1))
            .await
            .unwrap();
        h.session.set_telemetry(true).await.unwrap();
        h.session.disconnect().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            h.connector
                .publish_telemetry("sport_mode_state", serde_json::json!({})),
            0
        );
    }
}
