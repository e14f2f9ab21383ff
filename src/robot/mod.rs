//! Robot link and session lifecycle

pub mod link;
pub mod rtp_ingest;
pub mod session;

pub use link::{RobotConnector, RobotLink, RobotTarget, RobotTelemetry, LOCAL_AP_ADDRESS};
pub use rtp_ingest::RtpIngestConnector;
pub use session::{RobotSession, RobotStatus, SessionState};
