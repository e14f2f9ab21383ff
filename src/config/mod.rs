//! Application configuration

mod schema;
mod store;

pub use schema::{AppConfig, RobotConfig, StreamConfig, WebConfig, WebRtcConfig};
pub use store::ConfigStore;
