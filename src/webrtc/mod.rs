//! WebRTC relay for browser viewers
//!
//! ```text
//! Browser ── offer/ICE ──> MediaRelay ──> RelayConnection (one per viewer)
//!                              │                 │
//!                              │                 └─ RelayPeer (webrtc-rs RTCPeerConnection)
//!                              └─ upstream TrackFanout ── encoded samples ──> SampleSink
//! ```

pub mod config;
pub mod engine;
pub mod peer;
pub mod relay;
pub mod signaling;

pub use config::{IceServer, TurnServer, WebRtcConfig, PUBLIC_STUN_SERVER};
pub use engine::{AttachMode, PeerEngine, RelayPeer, SampleSink};
pub use peer::WebRtcEngine;
pub use relay::{MediaRelay, RelayConnection, RelayConnectionInfo, RelayPhase};
pub use signaling::{
    AnswerResponse, CloseRequest, ConnectionState, IceCandidate, IceCandidateRequest,
    OfferRequest,
};
