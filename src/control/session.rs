//! The single UI control channel
//!
//! Only one UI client holds the control channel. Attaching a new one
//! replaces the old holder: it is sent `session_replaced` and its channel
//! closes once drained. Notifications never block the caller.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::ServerMessage;

/// Queued outbound messages per control channel
const CONTROL_QUEUE: usize = 64;

struct Holder {
    id: u64,
    tx: mpsc::Sender<ServerMessage>,
}

/// Receiving end handed to the attached client
pub struct ControlChannel {
    pub id: u64,
    pub rx: mpsc::Receiver<ServerMessage>,
}

/// Last-writer-wins control channel slot
pub struct ControlSession {
    current: Mutex<Option<Holder>>,
    next_id: AtomicU64,
}

impl ControlSession {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Take over the control channel
    pub fn attach(&self) -> ControlChannel {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CONTROL_QUEUE);

        let previous = self.current.lock().replace(Holder { id, tx });
        if let Some(previous) = previous {
            info!(
                "Control channel {} replaced by {}",
                previous.id, id
            );
            let _ = previous.tx.try_send(ServerMessage::SessionReplaced);
        } else {
            info!("Control channel {} attached", id);
        }

        ControlChannel { id, rx }
    }

    /// Release the channel if `id` still holds it
    pub fn detach(&self, id: u64) {
        let mut current = self.current.lock();
        if current.as_ref().map(|h| h.id) == Some(id) {
            *current = None;
            info!("Control channel {} detached", id);
        }
    }

    /// Id of the current holder
    pub fn holder(&self) -> Option<u64> {
        self.current.lock().as_ref().map(|h| h.id)
    }

    /// Queue a message for the current holder. Returns whether it was queued.
    pub fn notify(&self, message: ServerMessage) -> bool {
        let tx = match self.current.lock().as_ref() {
            Some(holder) => holder.tx.clone(),
            None => {
                debug!("No control channel attached, dropping {:?}", message);
                return false;
            }
        };

        match tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!("Control channel full, dropping {:?}", message);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Control channel closed");
                false
            }
        }
    }
}

impl Default for ControlSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notify_reaches_holder() {
        let session = ControlSession::new();
        let mut channel = session.attach();

        assert!(session.notify(ServerMessage::RobotState { connected: true }));
        assert_eq!(
            channel.rx.recv().await,
            Some(ServerMessage::RobotState { connected: true })
        );
    }

    #[tokio::test]
    async fn test_attach_replaces_previous_holder() {
        let session = ControlSession::new();
        let mut first = session.attach();
        let mut second = session.attach();

        assert_eq!(first.rx.recv().await, Some(ServerMessage::SessionReplaced));
        assert_eq!(first.rx.recv().await, None);

        session.notify(ServerMessage::ok());
        assert_eq!(second.rx.recv().await, Some(ServerMessage::ok()));
        assert_eq!(session.holder(), Some(second.id));
    }

    #[tokio::test]
    async fn test_stale_detach_keeps_new_holder() {
        let session = ControlSession::new();
        let first = session.attach();
        let second = session.attach();

        session.detach(first.id);
        assert_eq!(session.holder(), Some(second.id));

        session.detach(second.id);
        assert_eq!(session.holder(), None);
        assert!(!session.notify(ServerMessage::ok()));
    }

    #[test]
    fn test_notify_never_blocks_when_full() {
        let session = ControlSession::new();
        let _channel = session.attach();
        for _ in 0..CONTROL_QUEUE {
            assert!(session.notify(ServerMessage::ok()));
        }
        assert!(!session.notify(ServerMessage::ok()));
    }
}
