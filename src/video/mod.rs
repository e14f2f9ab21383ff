//! Video plumbing between the robot track and the viewers
//!
//! ```text
//! RobotLink ── MediaTrack ──> TrackFanout ──> MediaRelay (encoded samples, no re-encode)
//!                                   │
//!                                   └──> frame producer ── FrameTranscoder ──> FrameBroadcaster
//! ```

pub mod broadcaster;
pub mod codec;
pub mod frame;
pub mod track;
pub mod transcode;

pub use broadcaster::{BroadcastFrame, FrameBroadcaster, FrameSubscriber};
pub use codec::VideoCodec;
pub use frame::VideoFrame;
pub use track::{MediaTrack, TrackFanout, TrackSubscription};
pub use transcode::{FrameTranscoder, JpegTranscoder, TranscoderFactory};
