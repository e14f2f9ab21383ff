//! Media-engine seam used by the relay
//!
//! The relay never touches ICE/DTLS/SRTP or SDP parsing itself. It drives
//! a [`PeerEngine`] through these traits; [`super::peer::WebRtcEngine`]
//! implements them on top of webrtc-rs.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

use super::signaling::{ConnectionState, IceCandidate};
use crate::error::Result;
use crate::video::{VideoCodec, VideoFrame};

/// How a connection's outbound sender came to carry an upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachMode {
    /// The idle sender created with the peer started carrying samples
    StartedIdleSender,
    /// Same sender and codec, forwarding moved to a newer upstream
    SwappedUpstream,
    /// The sender's track was replaced to carry a different codec
    ReplacedTrack,
}

/// Creates one peer connection per viewer
#[async_trait]
pub trait PeerEngine: Send + Sync {
    /// Build a new peer connection for `connection_id`, with an idle
    /// outbound video sender for `codec` already in place
    async fn create_peer(&self, connection_id: &str, codec: VideoCodec)
        -> Result<Arc<dyn RelayPeer>>;
}

/// One viewer-facing peer connection.
///
/// The outbound video sender exists from creation, so the first answer
/// already negotiates it and an upstream installed later only has to
/// start writing samples into it.
#[async_trait]
pub trait RelayPeer: Send + Sync {
    /// Sender negotiated with the viewer
    fn video_sink(&self) -> Arc<dyn SampleSink>;

    /// Swap the sender's track for one carrying `codec`
    async fn replace_video(&self, codec: VideoCodec) -> Result<Arc<dyn SampleSink>>;

    /// Apply a remote offer, create and apply the local answer, return it
    async fn apply_offer(&self, offer_sdp: &str) -> Result<String>;

    /// Apply a trickled remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Transport state changes
    fn state_watch(&self) -> watch::Receiver<ConnectionState>;

    /// Tear the connection down
    async fn close(&self) -> Result<()>;
}

/// Outbound sender that accepts encoded samples as-is
#[async_trait]
pub trait SampleSink: Send + Sync {
    /// Codec the sender was negotiated for
    fn codec(&self) -> VideoCodec;

    /// Send one encoded sample
    async fn write_frame(&self, frame: &VideoFrame) -> Result<()>;
}
