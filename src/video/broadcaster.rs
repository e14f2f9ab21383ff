//! Latest-frame broadcaster for push-socket viewers
//!
//! Holds exactly one encoded image (the newest) and lets any number of
//! consumers wait for it without polling. Publishing replaces the slot
//! and bumps the watch version, so a waiter that subscribed before the
//! publish is always woken; a consumer that finds a frame already in the
//! slot never waits at all. There is no per-consumer queue: a slow
//! consumer simply sees fewer frames.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Frame slot content
#[derive(Debug, Clone)]
pub struct BroadcastFrame {
    /// Encoded image payload (JPEG)
    pub data: Bytes,
    /// Publish sequence, starting at 1
    pub sequence: u64,
    /// When the frame was published
    pub published_at: Instant,
}

/// Single-slot, single-writer, multi-reader frame broadcaster
pub struct FrameBroadcaster {
    slot: watch::Sender<Option<BroadcastFrame>>,
    sequence: AtomicU64,
}

impl FrameBroadcaster {
    /// Create an empty broadcaster
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot,
            sequence: AtomicU64::new(0),
        }
    }

    /// Store `frame` as the current slot value and wake every waiter.
    ///
    /// Never waits on readers. Only the frame-production path calls this.
    pub fn publish(&self, frame: Bytes) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        self.slot.send_replace(Some(BroadcastFrame {
            data: frame,
            sequence,
            published_at: Instant::now(),
        }));
    }

    /// Current frame, waiting for the first publish if the slot is empty.
    ///
    /// Returns immediately when a frame is present. Otherwise waits until
    /// a publish or until `timeout` elapses, then returns whatever the
    /// slot holds (possibly still `None`). `None` timeout waits forever.
    pub async fn get_frame(&self, timeout: Option<Duration>) -> Option<Bytes> {
        let mut rx = self.slot.subscribe();
        if let Some(frame) = rx.borrow_and_update().as_ref() {
            return Some(frame.data.clone());
        }

        match timeout {
            Some(limit) => {
                let _ = tokio::time::timeout(limit, rx.changed()).await;
            }
            None => {
                let _ = rx.changed().await;
            }
        }

        let current = rx.borrow();
        current.as_ref().map(|frame| frame.data.clone())
    }

    /// Current slot content without waiting
    pub fn latest(&self) -> Option<BroadcastFrame> {
        self.slot.borrow().clone()
    }

    /// Number of frames published so far
    pub fn published_count(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Create a per-viewer subscriber that yields each frame at most once
    pub fn subscribe(&self) -> FrameSubscriber {
        FrameSubscriber {
            rx: self.slot.subscribe(),
            last_sequence: 0,
        }
    }

    /// Number of active subscribers and pending waiters
    pub fn receiver_count(&self) -> usize {
        self.slot.receiver_count()
    }
}

impl Default for FrameBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Push-loop helper: newest frame not yet delivered to this viewer
pub struct FrameSubscriber {
    rx: watch::Receiver<Option<BroadcastFrame>>,
    last_sequence: u64,
}

impl FrameSubscriber {
    /// Wait up to `wait` for a frame newer than the last one returned.
    ///
    /// Intermediate frames published while the viewer was busy are
    /// skipped. Returns `None` when nothing new arrived in time.
    pub async fn next_frame(&mut self, wait: Duration) -> Option<BroadcastFrame> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            {
                let current = self.rx.borrow_and_update();
                if let Some(frame) = current.as_ref() {
                    if frame.sequence > self.last_sequence {
                        self.last_sequence = frame.sequence;
                        return Some(frame.clone());
                    }
                }
            }

            match tokio::time::timeout_at(deadline, self.rx.changed()).await {
                Ok(Ok(())) => continue,
                // Deadline hit, or the broadcaster is gone
                Ok(Err(_)) | Err(_) => return None,
            }
        }
    }

    /// Sequence of the last frame handed out
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }
}
