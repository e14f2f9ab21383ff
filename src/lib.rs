//! go2-bridge - robot video bridge
//!
//! Connects to one robot, takes its video track and serves it to many
//! browser viewers: over WebRTC without re-encoding, and as JPEG frames
//! pushed over a WebSocket for simple clients.

pub mod config;
pub mod control;
pub mod error;
pub mod robot;
pub mod state;
pub mod utils;
pub mod video;
pub mod web;
pub mod webrtc;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{AppError, Result};
