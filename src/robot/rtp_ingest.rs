//! RTP ingest robot link
//!
//! The robot streams its camera as RTP over UDP. This connector binds the
//! ingest port, waits for the first packet from the robot's address and
//! then depacketizes the stream into encoded samples:
//!
//! ```text
//! UDP datagram -> rtp::packet::Packet -> SampleBuilder<Depacketizer> -> VideoFrame -> RtpTrack
//! ```
//!
//! Silence longer than the idle timeout is treated as link loss.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex as ParkingMutex;
use rtp::codecs::h264::H264Packet;
use rtp::codecs::vp8::Vp8Packet;
use rtp::packet::Packet;
use rtp::packetizer::Depacketizer;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::util::Unmarshal;

use super::link::{RobotConnector, RobotLink, RobotTarget};
use crate::error::{AppError, Result};
use crate::utils::LogThrottle;
use crate::video::frame::h264_has_idr;
use crate::video::{MediaTrack, VideoCodec, VideoFrame};

/// Largest datagram accepted on the ingest socket
const MAX_DATAGRAM: usize = 1500;

/// Packets the sample builder holds back while waiting for reordering
const MAX_LATE_PACKETS: u16 = 256;

/// Samples queued between the reader and the track consumer
const SAMPLE_QUEUE: usize = 32;

/// Connects by listening for the robot's RTP stream
pub struct RtpIngestConnector {
    listen: SocketAddr,
    codec: VideoCodec,
    idle_timeout: Duration,
}

impl RtpIngestConnector {
    pub fn new(listen: SocketAddr, codec: VideoCodec, idle_timeout: Duration) -> Self {
        Self {
            listen,
            codec,
            idle_timeout,
        }
    }

    fn source_address(target: &RobotTarget) -> Result<IpAddr> {
        let host = target.host().ok_or_else(|| {
            AppError::Config(format!("{} needs a robot ip for RTP ingest", target))
        })?;
        host.parse()
            .map_err(|_| AppError::Config(format!("Invalid robot ip: {}", host)))
    }
}

#[async_trait]
impl RobotConnector for RtpIngestConnector {
    async fn connect(&self, target: &RobotTarget) -> Result<Box<dyn RobotLink>> {
        let source = Self::source_address(target)?;
        if self.codec == VideoCodec::VP9 {
            return Err(AppError::Config(
                "RTP ingest supports h264 and vp8 only".to_string(),
            ));
        }

        let socket = UdpSocket::bind(self.listen).await.map_err(|e| {
            AppError::RobotLink(format!("Failed to bind RTP ingest on {}: {}", self.listen, e))
        })?;
        info!(
            "Waiting for robot RTP from {} on {}",
            source,
            socket.local_addr().unwrap_or(self.listen)
        );

        // The session's connect timeout bounds this wait
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let first = loop {
            let (n, from) = socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| AppError::RobotLink(format!("RTP ingest receive failed: {}", e)))?;
            if from.ip() == source {
                break Bytes::copy_from_slice(&buf[..n]);
            }
            debug!("Ignoring datagram from {} while waiting for robot", from);
        };
        info!("Robot RTP stream from {} is live", source);

        let (tx, rx) = mpsc::channel(SAMPLE_QUEUE);
        let cancel = CancellationToken::new();
        let connected = Arc::new(AtomicBool::new(true));

        let reader = IngestReader {
            socket,
            source,
            codec: self.codec,
            idle_timeout: self.idle_timeout,
            tx,
            cancel: cancel.clone(),
            connected: connected.clone(),
            malformed_log: LogThrottle::with_secs(10),
        };
        let handle = match self.codec {
            VideoCodec::VP8 => tokio::spawn(reader.run(Vp8Packet::default(), first)),
            _ => tokio::spawn(reader.run(H264Packet::default(), first)),
        };

        let track = Arc::new(RtpTrack {
            id: format!("robot-{}", source),
            codec: self.codec,
            rx: Mutex::new(rx),
        });

        Ok(Box::new(RtpIngestLink {
            track,
            cancel,
            connected,
            reader: ParkingMutex::new(Some(handle)),
        }))
    }
}

struct IngestReader {
    socket: UdpSocket,
    source: IpAddr,
    codec: VideoCodec,
    idle_timeout: Duration,
    tx: mpsc::Sender<VideoFrame>,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
    malformed_log: LogThrottle,
}

impl IngestReader {
    async fn run<D>(mut self, depacketizer: D, first: Bytes)
    where
        D: Depacketizer + Send + 'static,
    {
        let mut builder = SampleBuilder::new(MAX_LATE_PACKETS, depacketizer, self.codec.clock_rate());
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut sequence = 0u64;

        if !self.ingest(&mut builder, &first, &mut sequence) {
            self.connected.store(false, Ordering::SeqCst);
            return;
        }

        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("RTP ingest from {} cancelled", self.source);
                    break;
                }
                received = tokio::time::timeout(self.idle_timeout, self.socket.recv_from(&mut buf)) => received,
            };

            let (n, from) = match received {
                Err(_) => {
                    warn!(
                        "No RTP from robot {} for {:?}, treating link as lost",
                        self.source, self.idle_timeout
                    );
                    break;
                }
                Ok(Err(e)) => {
                    warn!("RTP ingest socket error: {}", e);
                    break;
                }
                Ok(Ok(received)) => received,
            };
            if from.ip() != self.source {
                trace!("Ignoring datagram from {}", from);
                continue;
            }
            if !self.ingest(&mut builder, &buf[..n], &mut sequence) {
                break;
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        info!(
            "RTP ingest from {} stopped after {} samples",
            self.source, sequence
        );
    }

    /// Feed one datagram; false once nobody consumes the track any more
    fn ingest<D: Depacketizer>(
        &mut self,
        builder: &mut SampleBuilder<D>,
        datagram: &[u8],
        sequence: &mut u64,
    ) -> bool {
        let mut raw = datagram;
        let packet = match Packet::unmarshal(&mut raw) {
            Ok(packet) => packet,
            Err(e) => {
                if let Some(skipped) = self.malformed_log.check() {
                    warn!(
                        "Dropping malformed RTP packet from {}: {} ({} more since last report)",
                        self.source, e, skipped
                    );
                }
                return true;
            }
        };
        builder.push(packet);

        while let Some(sample) = builder.pop() {
            *sequence += 1;
            let key_frame = match self.codec {
                VideoCodec::H264 => h264_has_idr(&sample.data),
                // VP8 payload header: P bit clear on key frames
                _ => sample.data.first().map(|b| b & 0x01 == 0).unwrap_or(false),
            };
            let frame = VideoFrame::new(sample.data, self.codec, sample.duration, *sequence)
                .with_key_frame(key_frame);

            match self.tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!("Track consumer behind, dropping sample {}", sequence);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return false,
            }
        }
        true
    }
}

/// Video track fed by the ingest reader
struct RtpTrack {
    id: String,
    codec: VideoCodec,
    rx: Mutex<mpsc::Receiver<VideoFrame>>,
}

#[async_trait]
impl MediaTrack for RtpTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn codec(&self) -> VideoCodec {
        self.codec
    }

    async fn recv(&self) -> Option<VideoFrame> {
        self.rx.lock().await.recv().await
    }
}

struct RtpIngestLink {
    track: Arc<RtpTrack>,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
    reader: ParkingMutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl RobotLink for RtpIngestLink {
    fn video_track(&self) -> Arc<dyn MediaTrack> {
        self.track.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.cancel.cancel();
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                warn!("RTP ingest reader ended abnormally: {}", e);
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for RtpIngestLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
