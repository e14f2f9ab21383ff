//! Encoded video sample as delivered by the robot track

use bytes::Bytes;
use std::time::Duration;

use super::codec::VideoCodec;

/// One encoded video sample (an H.264 access unit, a VP8 frame, ...)
///
/// Cloning is cheap: the payload is reference counted, so fanning one
/// sample out to many relay connections never copies the bitstream.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Encoded payload
    data: Bytes,
    /// Codec of the payload
    pub codec: VideoCodec,
    /// Whether this sample starts a decodable sequence
    pub key_frame: bool,
    /// Presentation duration (used for RTP timestamp advance)
    pub duration: Duration,
    /// Sample sequence number
    pub sequence: u64,
}

impl VideoFrame {
    /// Create a new encoded sample
    pub fn new(data: Bytes, codec: VideoCodec, duration: Duration, sequence: u64) -> Self {
        Self {
            data,
            codec,
            key_frame: false,
            duration,
            sequence,
        }
    }

    /// Mark the sample as a key frame
    pub fn with_key_frame(mut self, key_frame: bool) -> Self {
        self.key_frame = key_frame;
        self
    }

    /// Get payload as bytes slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get payload as Bytes (cheap clone)
    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Get payload length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the payload is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Check whether an Annex-B H.264 access unit contains an IDR slice
pub fn h264_has_idr(data: &[u8]) -> bool {
    let mut i = 0;
    while i + 3 < data.len() {
        let start_len = if data[i..].starts_with(&[0, 0, 0, 1]) {
            4
        } else if data[i..].starts_with(&[0, 0, 1]) {
            3
        } else {
            i += 1;
            continue;
        };
        if let Some(header) = data.get(i + start_len) {
            if header & 0x1F == 5 {
                return true;
            }
        }
        i += start_len;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_clone_shares_payload() {
        let frame = VideoFrame::new(
            Bytes::from_static(&[0, 0, 0, 1, 0x65, 0xAA]),
            VideoCodec::H264,
            Duration::from_millis(33),
            7,
        );
        let copy = frame.clone();
        assert_eq!(copy.data().as_ptr(), frame.data().as_ptr());
        assert_eq!(copy.sequence, 7);
        assert!(!frame.is_empty());
    }

    #[test]
    fn test_h264_idr_detection() {
        assert!(h264_has_idr(&[0, 0, 0, 1, 0x67, 0x42, 0, 0, 1, 0x65, 0x88]));
        assert!(!h264_has_idr(&[0, 0, 0, 1, 0x41, 0x9A, 0x00]));
        assert!(!h264_has_idr(&[]));
    }
}
