//! Video codec descriptors shared by the relay and push paths

use serde::{Deserialize, Serialize};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

/// Codec of the encoded samples carried by a robot track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// H.264/AVC
    #[default]
    H264,
    /// VP8
    VP8,
    /// VP9
    VP9,
}

impl VideoCodec {
    /// Get MIME type for SDP
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/H264",
            VideoCodec::VP8 => "video/VP8",
            VideoCodec::VP9 => "video/VP9",
        }
    }

    /// Get RTP clock rate (always 90kHz for video)
    pub fn clock_rate(&self) -> u32 {
        90000
    }

    /// Get SDP fmtp parameters
    pub fn sdp_fmtp(&self) -> &'static str {
        match self {
            VideoCodec::H264 => {
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            }
            VideoCodec::VP8 => "",
            VideoCodec::VP9 => "profile-id=0",
        }
    }

    /// RTP codec capability used when creating outbound tracks
    pub fn capability(&self) -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: self.mime_type().to_string(),
            clock_rate: self.clock_rate(),
            channels: 0,
            sdp_fmtp_line: self.sdp_fmtp().to_string(),
            rtcp_feedback: vec![],
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoCodec::H264 => write!(f, "H.264"),
            VideoCodec::VP8 => write!(f, "VP8"),
            VideoCodec::VP9 => write!(f, "VP9"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_matches_codec() {
        let cap = VideoCodec::H264.capability();
        assert_eq!(cap.mime_type, "video/H264");
        assert_eq!(cap.clock_rate, 90000);
        assert!(cap.sdp_fmtp_line.contains("packetization-mode=1"));
    }

    #[test]
    fn test_serde_lowercase() {
        let codec: VideoCodec = serde_json::from_str("\"vp8\"").unwrap();
        assert_eq!(codec, VideoCodec::VP8);
        assert_eq!(serde_json::to_string(&VideoCodec::H264).unwrap(), "\"h264\"");
    }
}
