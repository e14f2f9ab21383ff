//! Media relay: one upstream track, many viewer peer connections
//!
//! Each viewer gets its own [`RelayConnection`], keyed by an opaque id.
//! The upstream robot track is fanned out without re-encoding: every
//! connection owns a subscription to the [`TrackFanout`] and a forwarding
//! task that writes the encoded samples into its outbound sender.
//!
//! Locking:
//! - the registry lock only guards insert/remove/lookup and is never held
//!   across peer creation, negotiation or track attachment;
//! - each connection has its own async mutex, so offer/answer/ICE work for
//!   one id is strictly serialized while distinct ids proceed concurrently.

use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{AttachMode, PeerEngine, RelayPeer, SampleSink};
use super::signaling::{ConnectionState, IceCandidate};
use crate::error::{AppError, Result};
use crate::video::{TrackFanout, TrackSubscription, VideoCodec};

/// Candidates kept per connection while waiting for the offer
const MAX_PENDING_CANDIDATES: usize = 64;

/// Negotiation phase of a relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayPhase {
    Created,
    OfferReceived,
    Answered,
    Connected,
    Closed,
}

impl std::fmt::Display for RelayPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayPhase::Created => write!(f, "created"),
            RelayPhase::OfferReceived => write!(f, "offer_received"),
            RelayPhase::Answered => write!(f, "answered"),
            RelayPhase::Connected => write!(f, "connected"),
            RelayPhase::Closed => write!(f, "closed"),
        }
    }
}

/// Snapshot of one relay connection
#[derive(Debug, Clone, Serialize)]
pub struct RelayConnectionInfo {
    pub connection_id: String,
    pub phase: RelayPhase,
    pub receiving_upstream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attach_mode: Option<AttachMode>,
    pub pending_candidates: usize,
    pub age_secs: u64,
}

/// Upstream installed on the relay
#[derive(Clone)]
struct Upstream {
    fanout: Arc<TrackFanout>,
    generation: u64,
}

/// Mutable per-connection state, guarded by the connection's op lock
struct ConnectionInner {
    peer: Option<Arc<dyn RelayPeer>>,
    sink: Option<Arc<dyn SampleSink>>,
    forwarder: Option<CancellationToken>,
    attached_generation: u64,
    attach_mode: Option<AttachMode>,
    pending_candidates: Vec<IceCandidate>,
    remote_applied: bool,
    closed: bool,
}

/// One browser viewer
pub struct RelayConnection {
    id: String,
    created_at: Instant,
    inner: Mutex<ConnectionInner>,
    phase: Arc<watch::Sender<RelayPhase>>,
    cancel: CancellationToken,
}

impl RelayConnection {
    fn new(id: &str) -> Self {
        let (phase, _) = watch::channel(RelayPhase::Created);
        Self {
            id: id.to_string(),
            created_at: Instant::now(),
            inner: Mutex::new(ConnectionInner {
                peer: None,
                sink: None,
                forwarder: None,
                attached_generation: 0,
                attach_mode: None,
                pending_candidates: Vec::new(),
                remote_applied: false,
                closed: false,
            }),
            phase: Arc::new(phase),
            cancel: CancellationToken::new(),
        }
    }

    /// Connection identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current negotiation phase
    pub fn phase(&self) -> RelayPhase {
        *self.phase.borrow()
    }

    /// Watch phase changes
    pub fn phase_watch(&self) -> watch::Receiver<RelayPhase> {
        self.phase.subscribe()
    }

    /// Whether a forwarding subscription is currently installed
    pub async fn is_receiving_upstream(&self) -> bool {
        let inner = self.inner.lock().await;
        inner
            .forwarder
            .as_ref()
            .map(|token| !token.is_cancelled())
            .unwrap_or(false)
    }

    /// Number of candidates waiting for the remote description
    async fn pending_candidate_count(&self) -> usize {
        self.inner.lock().await.pending_candidates.len()
    }

    /// How the current upstream reached this connection's sender
    pub async fn attach_mode(&self) -> Option<AttachMode> {
        self.inner.lock().await.attach_mode
    }

    async fn info(&self) -> RelayConnectionInfo {
        RelayConnectionInfo {
            connection_id: self.id.clone(),
            phase: self.phase(),
            receiving_upstream: self.is_receiving_upstream().await,
            attach_mode: self.attach_mode().await,
            pending_candidates: self.pending_candidate_count().await,
            age_secs: self.created_at.elapsed().as_secs(),
        }
    }

    /// Start forwarding `upstream` into this connection's sender. Returns
    /// `None` when that upstream (or a newer one) is already attached.
    async fn attach_locked(
        &self,
        inner: &mut ConnectionInner,
        peer: &Arc<dyn RelayPeer>,
        upstream: &Upstream,
    ) -> Result<Option<AttachMode>> {
        if inner.attached_generation >= upstream.generation {
            return Ok(None);
        }

        let codec = upstream.fanout.codec();
        let (sink, mode) = match &inner.sink {
            Some(sink) if sink.codec() == codec => {
                let mode = if inner.attached_generation == 0 {
                    AttachMode::StartedIdleSender
                } else {
                    AttachMode::SwappedUpstream
                };
                (sink.clone(), mode)
            }
            _ => (peer.replace_video(codec).await?, AttachMode::ReplacedTrack),
        };

        if let Some(previous) = inner.forwarder.take() {
            previous.cancel();
        }
        let token = self.cancel.child_token();
        spawn_forwarder(
            self.id.clone(),
            upstream.fanout.subscribe(),
            sink.clone(),
            token.clone(),
        );

        inner.sink = Some(sink);
        inner.forwarder = Some(token);
        inner.attached_generation = upstream.generation;
        inner.attach_mode = Some(mode);
        Ok(Some(mode))
    }

    /// Attach a newly installed upstream to an already-built connection
    async fn attach_upstream(&self, upstream: &Upstream) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        // Not built yet: the builder reads the upstream under this same lock
        let peer = match &inner.peer {
            Some(peer) => peer.clone(),
            None => return Ok(()),
        };

        match self.attach_locked(&mut inner, &peer, upstream).await? {
            Some(mode) => info!(
                "Relay connection {} attached to upstream {} ({:?})",
                self.id,
                upstream.fanout.track_id(),
                mode
            ),
            None => debug!(
                "Relay connection {} already carries upstream {}",
                self.id,
                upstream.fanout.track_id()
            ),
        }
        Ok(())
    }

    fn spawn_state_monitor(&self, peer: &Arc<dyn RelayPeer>) {
        let mut state_rx = peer.state_watch();
        let phase = self.phase.clone();
        let cancel = self.cancel.clone();
        let id = self.id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *state_rx.borrow_and_update();
                        match state {
                            ConnectionState::Connected => {
                                phase.send_if_modified(|p| {
                                    if *p == RelayPhase::Answered {
                                        *p = RelayPhase::Connected;
                                        true
                                    } else {
                                        false
                                    }
                                });
                            }
                            ConnectionState::Failed | ConnectionState::Disconnected => {
                                debug!("Relay connection {} transport {}, awaiting viewer", id, state);
                            }
                            _ => {}
                        }
                    }
                }
            }
        });
    }

    async fn close(&self) {
        self.cancel.cancel();

        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }
        inner.closed = true;
        if let Some(forwarder) = inner.forwarder.take() {
            forwarder.cancel();
        }
        inner.sink = None;
        inner.pending_candidates.clear();

        if let Some(peer) = inner.peer.take() {
            if let Err(e) = peer.close().await {
                warn!("Failed to close relay connection {}: {}", self.id, e);
            }
        }
        let _ = self.phase.send_replace(RelayPhase::Closed);
        info!("Relay connection {} closed", self.id);
    }
}

/// Forward upstream samples into one connection's sender until cancelled,
/// the upstream ends, or the sender breaks
fn spawn_forwarder(
    connection_id: String,
    mut subscription: TrackSubscription,
    sink: Arc<dyn SampleSink>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        debug!(
            "Forwarding {} to relay connection {}",
            subscription.track_id(),
            connection_id
        );
        // Late joiners cannot decode H.264 until the next IDR
        let mut awaiting_key_frame = sink.codec() == VideoCodec::H264;
        let mut sent = 0u64;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                frame = subscription.recv() => {
                    let frame = match frame {
                        Some(frame) => frame,
                        None => {
                            debug!("Upstream ended for relay connection {}", connection_id);
                            break;
                        }
                    };
                    if awaiting_key_frame {
                        if !frame.key_frame {
                            continue;
                        }
                        awaiting_key_frame = false;
                    }
                    if let Err(e) = sink.write_frame(&frame).await {
                        warn!("Relay connection {} sender failed: {}", connection_id, e);
                        break;
                    }
                    sent += 1;
                }
            }
        }

        token.cancel();
        debug!(
            "Forwarder for relay connection {} stopped after {} samples",
            connection_id, sent
        );
    });
}

/// Registry of viewer connections plus the current upstream
pub struct MediaRelay {
    engine: Arc<dyn PeerEngine>,
    /// Codec of the idle sender given to connections made before any upstream
    idle_codec: VideoCodec,
    connections: RwLock<HashMap<String, Arc<RelayConnection>>>,
    upstream: parking_lot::RwLock<Option<Upstream>>,
    generation: AtomicU64,
}

impl MediaRelay {
    /// Create an empty relay over `engine`. Connections created before an
    /// upstream exists negotiate `idle_codec`.
    pub fn new(engine: Arc<dyn PeerEngine>, idle_codec: VideoCodec) -> Self {
        Self {
            engine,
            idle_codec,
            connections: RwLock::new(HashMap::new()),
            upstream: parking_lot::RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Install `track` as the upstream for every current and future
    /// connection, replacing any previous upstream.
    ///
    /// Attachment failures are logged per connection and never abort
    /// attachment to the others.
    pub async fn set_upstream_track(&self, track: Arc<TrackFanout>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let upstream = Upstream {
            fanout: track,
            generation,
        };
        *self.upstream.write() = Some(upstream.clone());
        info!(
            "Relay upstream set to {} (generation {})",
            upstream.fanout.track_id(),
            generation
        );

        let connections: Vec<Arc<RelayConnection>> =
            self.connections.read().await.values().cloned().collect();

        let results = join_all(
            connections
                .iter()
                .map(|connection| connection.attach_upstream(&upstream)),
        )
        .await;

        for (connection, result) in connections.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    "Failed to attach upstream to relay connection {}: {}",
                    connection.id(),
                    e
                );
            }
        }
    }

    /// Forget the upstream. Existing connections are left open; their
    /// forwarders end with the upstream and they simply stop receiving.
    pub fn clear_upstream_track(&self) {
        if let Some(previous) = self.upstream.write().take() {
            info!("Relay upstream {} cleared", previous.fanout.track_id());
        }
    }

    /// Whether an upstream is installed
    pub fn has_upstream(&self) -> bool {
        self.upstream.read().is_some()
    }

    /// Track id of the installed upstream
    pub fn upstream_track_id(&self) -> Option<String> {
        self.upstream
            .read()
            .as_ref()
            .map(|up| up.fanout.track_id().to_string())
    }

    /// Number of `set_upstream_track` calls so far
    pub fn upstream_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Create the connection for `id` (or return the existing one). With an
    /// upstream present the connection is attached immediately; otherwise
    /// its idle sender starts carrying samples once an upstream is set.
    pub async fn create_connection(&self, id: &str) -> Result<Arc<RelayConnection>> {
        let connection = self.get_or_insert(id).await;
        let built = {
            let mut inner = connection.inner.lock().await;
            self.ensure_peer(&connection, &mut inner).await.map(|_| ())
        };
        if let Err(e) = built {
            self.remove_if_unbuilt(&connection).await;
            return Err(e);
        }
        Ok(connection)
    }

    /// Apply a viewer's offer and return the answer SDP
    pub async fn handle_offer(&self, id: &str, offer_sdp: &str) -> Result<String> {
        let connection = self.get_or_insert(id).await;
        let mut inner = connection.inner.lock().await;

        let built = self.ensure_peer(&connection, &mut inner).await;
        let peer = match built {
            Ok(peer) => peer,
            Err(e) => {
                drop(inner);
                self.remove_if_unbuilt(&connection).await;
                return Err(e);
            }
        };

        let previous = connection.phase();
        let _ = connection.phase.send_replace(RelayPhase::OfferReceived);
        debug!("Applying offer for relay connection {}", id);

        let answer = match peer.apply_offer(offer_sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                let _ = connection.phase.send_replace(previous);
                warn!("Negotiation failed for relay connection {}: {}", id, e);
                return Err(AppError::Negotiation {
                    connection_id: id.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        inner.remote_applied = true;
        let next = if *peer.state_watch().borrow() == ConnectionState::Connected {
            RelayPhase::Connected
        } else {
            RelayPhase::Answered
        };
        let _ = connection.phase.send_replace(next);

        let pending = std::mem::take(&mut inner.pending_candidates);
        if !pending.is_empty() {
            debug!(
                "Applying {} buffered ICE candidates for relay connection {}",
                pending.len(),
                id
            );
        }
        for candidate in pending {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!("Ignoring buffered ICE candidate for {}: {}", id, e);
            }
        }

        info!("Relay connection {} answered", id);
        Ok(answer)
    }

    /// Apply a trickled candidate. Unknown ids are ignored; engine errors
    /// are logged and swallowed.
    pub async fn add_ice_candidate(&self, id: &str, candidate: IceCandidate) {
        let connection = match self.connection(id).await {
            Some(connection) => connection,
            None => {
                debug!("ICE candidate for unknown relay connection {} ignored", id);
                return;
            }
        };

        let mut inner = connection.inner.lock().await;
        if inner.closed {
            return;
        }

        match (&inner.peer, inner.remote_applied) {
            (Some(peer), true) => {
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    warn!("Ignoring ICE candidate for {}: {}", id, e);
                }
            }
            _ => {
                if inner.pending_candidates.len() >= MAX_PENDING_CANDIDATES {
                    warn!("Too many early ICE candidates for {}, dropping oldest", id);
                    inner.pending_candidates.remove(0);
                }
                inner.pending_candidates.push(candidate);
            }
        }
    }

    /// Tear down and forget the connection. Unknown ids are a no-op.
    pub async fn close_connection(&self, id: &str) {
        let removed = self.connections.write().await.remove(id);
        match removed {
            Some(connection) => connection.close().await,
            None => debug!("Close for unknown relay connection {} ignored", id),
        }
    }

    /// Close every connection (shutdown)
    pub async fn close_all(&self) {
        let connections: Vec<Arc<RelayConnection>> = self
            .connections
            .write()
            .await
            .drain()
            .map(|(_, connection)| connection)
            .collect();

        let count = connections.len();
        join_all(connections.iter().map(|connection| connection.close())).await;
        if count > 0 {
            info!("Closed {} relay connections", count);
        }
    }

    /// Look up a connection
    pub async fn connection(&self, id: &str) -> Option<Arc<RelayConnection>> {
        self.connections.read().await.get(id).cloned()
    }

    /// Number of registered connections
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Snapshot of every connection
    pub async fn list_connections(&self) -> Vec<RelayConnectionInfo> {
        let connections: Vec<Arc<RelayConnection>> =
            self.connections.read().await.values().cloned().collect();
        let mut infos = join_all(connections.iter().map(|c| c.info())).await;
        infos.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        infos
    }

    async fn get_or_insert(&self, id: &str) -> Arc<RelayConnection> {
        if let Some(connection) = self.connections.read().await.get(id) {
            return connection.clone();
        }

        let mut connections = self.connections.write().await;
        connections
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!("Registering relay connection {}", id);
                Arc::new(RelayConnection::new(id))
            })
            .clone()
    }

    /// Build the peer on first use. Runs under the connection's op lock,
    /// never under the registry lock.
    async fn ensure_peer(
        &self,
        connection: &RelayConnection,
        inner: &mut ConnectionInner,
    ) -> Result<Arc<dyn RelayPeer>> {
        if inner.closed {
            return Err(AppError::WebRtcError(format!(
                "Relay connection {} is closed",
                connection.id
            )));
        }
        if let Some(peer) = &inner.peer {
            return Ok(peer.clone());
        }

        let upstream = self.upstream.read().clone();
        let codec = upstream
            .as_ref()
            .map(|up| up.fanout.codec())
            .unwrap_or(self.idle_codec);
        let peer = self.engine.create_peer(&connection.id, codec).await?;
        inner.sink = Some(peer.video_sink());

        let setup = match &upstream {
            Some(upstream) => connection
                .attach_locked(inner, &peer, upstream)
                .await
                .map(|mode| {
                    info!(
                        "Relay connection {} created with upstream {} ({:?})",
                        connection.id,
                        upstream.fanout.track_id(),
                        mode
                    );
                }),
            None => {
                info!(
                    "Relay connection {} created, waiting for upstream video",
                    connection.id
                );
                Ok(())
            }
        };

        if let Err(e) = setup {
            if let Some(forwarder) = inner.forwarder.take() {
                forwarder.cancel();
            }
            inner.sink = None;
            let _ = peer.close().await;
            return Err(e);
        }

        connection.spawn_state_monitor(&peer);
        inner.peer = Some(peer.clone());
        Ok(peer)
    }

    /// Drop a registry entry whose peer could not be built
    async fn remove_if_unbuilt(&self, connection: &Arc<RelayConnection>) {
        let unbuilt = connection.inner.lock().await.peer.is_none();
        if !unbuilt {
            return;
        }
        let mut connections = self.connections.write().await;
        if let Some(current) = connections.get(connection.id()) {
            if Arc::ptr_eq(current, connection) {
                connections.remove(connection.id());
            }
        }
    }
}
