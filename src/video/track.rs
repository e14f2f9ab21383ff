//! Upstream media track and single-reader fan-out
//!
//! A robot link exposes exactly one pull-based [`MediaTrack`]. Both the
//! WebRTC relay and the JPEG push path need to consume it independently,
//! so [`TrackFanout`] runs one pump task that reads the track and
//! republishes every sample into a bounded broadcast ring:
//!
//! ```text
//! MediaTrack::recv() ──pump──> broadcast ring ──> TrackSubscription (relay conn A)
//!                                              ├─> TrackSubscription (relay conn B)
//!                                              └─> TrackSubscription (frame producer)
//! ```
//!
//! A subscriber that falls behind skips samples instead of slowing the pump.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::codec::VideoCodec;
use super::frame::VideoFrame;

/// Ring size per subscription before lagging subscribers start skipping
const FANOUT_CAPACITY: usize = 64;

/// A possibly-infinite sequence of encoded video samples
#[async_trait]
pub trait MediaTrack: Send + Sync {
    /// Track identifier
    fn id(&self) -> &str;

    /// Codec of the samples
    fn codec(&self) -> VideoCodec;

    /// Wait for the next sample. `None` means the track has ended.
    async fn recv(&self) -> Option<VideoFrame>;
}

/// Fan-out of one [`MediaTrack`] to any number of subscribers
pub struct TrackFanout {
    track_id: String,
    codec: VideoCodec,
    /// Dropped once the pump exits so subscriptions observe end-of-stream
    tx: Mutex<Option<broadcast::Sender<VideoFrame>>>,
    /// Stops the pump
    cancel: CancellationToken,
    /// Cancelled by the pump on exit, for any reason
    ended: CancellationToken,
}

impl TrackFanout {
    /// Start pumping `track` into a new fan-out
    pub fn start(track: Arc<dyn MediaTrack>) -> Arc<Self> {
        let (tx, _) = broadcast::channel(FANOUT_CAPACITY);
        let fanout = Arc::new(Self {
            track_id: track.id().to_string(),
            codec: track.codec(),
            tx: Mutex::new(Some(tx.clone())),
            cancel: CancellationToken::new(),
            ended: CancellationToken::new(),
        });

        let cancel = fanout.cancel.clone();
        let ended = fanout.ended.clone();
        let weak = Arc::downgrade(&fanout);
        let track_id = fanout.track_id.clone();

        tokio::spawn(async move {
            info!("Track fan-out started for {}", track_id);
            let mut forwarded = 0u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Track fan-out for {} cancelled", track_id);
                        break;
                    }
                    sample = track.recv() => {
                        match sample {
                            Some(frame) => {
                                forwarded += 1;
                                // No receivers is normal between subscriptions
                                let _ = tx.send(frame);
                            }
                            None => {
                                info!("Upstream track {} ended", track_id);
                                break;
                            }
                        }
                    }
                }
            }

            drop(tx);
            if let Some(fanout) = weak.upgrade() {
                fanout.tx.lock().take();
            }
            ended.cancel();
            info!(
                "Track fan-out stopped for {} ({} samples forwarded)",
                track_id, forwarded
            );
        });

        fanout
    }

    /// Track identifier of the upstream
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// Codec of the upstream samples
    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    /// Subscribe to samples published from now on
    pub fn subscribe(&self) -> TrackSubscription {
        let rx = match self.tx.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                // Already ended: hand out a closed subscription
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        };
        TrackSubscription {
            track_id: self.track_id.clone(),
            rx,
        }
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.tx
            .lock()
            .as_ref()
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Stop the pump; every subscription then observes end-of-stream
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the pump has exited
    pub async fn ended(&self) {
        self.ended.cancelled().await
    }
}

impl Drop for TrackFanout {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One independent consumer of a [`TrackFanout`]
pub struct TrackSubscription {
    track_id: String,
    rx: broadcast::Receiver<VideoFrame>,
}

impl TrackSubscription {
    /// Next sample, skipping anything this subscriber was too slow for.
    /// `None` once the upstream has ended.
    pub async fn recv(&mut self) -> Option<VideoFrame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    trace!("Subscription to {} skipped {} samples", self.track_id, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Blocking variant of [`recv`](Self::recv) for worker threads
    pub fn blocking_recv(&mut self) -> Option<VideoFrame> {
        loop {
            match self.rx.blocking_recv() {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    trace!("Subscription to {} skipped {} samples", self.track_id, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Upstream track identifier
    pub fn track_id(&self) -> &str {
        &self.track_id
    }
}
