//! Push-path transcoding: encoded robot samples to JPEG images
//!
//! ```text
//! H.264 access unit ──openh264──> RGB24 ──turbojpeg──> JPEG
//! ```
//!
//! Transcoders are not required to be `Send`; the frame producer builds
//! its transcoder on the worker thread that uses it.

use bytes::Bytes;
use openh264::decoder::Decoder;
use openh264::formats::YUVSource;
use std::sync::Arc;
use tracing::debug;

use super::codec::VideoCodec;
use super::frame::VideoFrame;
use crate::error::{AppError, Result};

/// Converts encoded samples into self-contained images for push viewers
pub trait FrameTranscoder {
    /// Transcode one sample. `Ok(None)` means the sample produced no
    /// picture yet (e.g. parameter sets only).
    fn transcode(&mut self, frame: &VideoFrame) -> Result<Option<Bytes>>;
}

/// Builds a transcoder for the codec of the current upstream
pub type TranscoderFactory =
    Arc<dyn Fn(VideoCodec) -> Result<Box<dyn FrameTranscoder>> + Send + Sync>;

/// H.264 to JPEG transcoder
pub struct JpegTranscoder {
    decoder: Decoder,
    compressor: turbojpeg::Compressor,
    /// RGB24 scratch buffer, resized on resolution change
    rgb_buffer: Vec<u8>,
    dimensions: (usize, usize),
}

impl JpegTranscoder {
    /// Create a transcoder for `codec` producing JPEG at `quality` (1-100)
    pub fn new(codec: VideoCodec, quality: u32) -> Result<Self> {
        if codec != VideoCodec::H264 {
            return Err(AppError::VideoError(format!(
                "JPEG push path does not support {} input",
                codec
            )));
        }

        let decoder = Decoder::new()
            .map_err(|e| AppError::VideoError(format!("Failed to create H.264 decoder: {}", e)))?;

        let mut compressor = turbojpeg::Compressor::new().map_err(|e| {
            AppError::VideoError(format!("Failed to create turbojpeg compressor: {}", e))
        })?;
        compressor
            .set_quality(quality.clamp(1, 100) as i32)
            .map_err(|e| AppError::VideoError(format!("Failed to set JPEG quality: {}", e)))?;

        Ok(Self {
            decoder,
            compressor,
            rgb_buffer: Vec::new(),
            dimensions: (0, 0),
        })
    }

    /// Factory producing JPEG transcoders at a fixed quality
    pub fn factory(quality: u32) -> TranscoderFactory {
        Arc::new(move |codec| {
            let transcoder = JpegTranscoder::new(codec, quality)?;
            Ok(Box::new(transcoder) as Box<dyn FrameTranscoder>)
        })
    }
}

impl FrameTranscoder for JpegTranscoder {
    fn transcode(&mut self, frame: &VideoFrame) -> Result<Option<Bytes>> {
        let yuv = match self
            .decoder
            .decode(frame.data())
            .map_err(|e| AppError::VideoError(format!("H.264 decode failed: {}", e)))?
        {
            Some(yuv) => yuv,
            None => return Ok(None),
        };

        let (width, height) = yuv.dimensions();
        if (width, height) != self.dimensions {
            debug!("Push path resolution changed to {}x{}", width, height);
            self.rgb_buffer.resize(width * height * 3, 0);
            self.dimensions = (width, height);
        }
        yuv.write_rgb8(&mut self.rgb_buffer);

        let image = turbojpeg::Image {
            pixels: self.rgb_buffer.as_slice(),
            width,
            pitch: width * 3,
            height,
            format: turbojpeg::PixelFormat::RGB,
        };
        let jpeg = self
            .compressor
            .compress_to_vec(image)
            .map_err(|e| AppError::VideoError(format!("JPEG compression failed: {}", e)))?;

        Ok(Some(Bytes::from(jpeg)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unsupported_codec() {
        let err = JpegTranscoder::new(VideoCodec::VP8, 80).err().unwrap();
        assert!(matches!(err, AppError::VideoError(_)));
    }

    #[test]
    fn test_factory_reports_codec_errors() {
        let factory = JpegTranscoder::factory(80);
        assert!(factory(VideoCodec::VP9).is_err());
    }
}
