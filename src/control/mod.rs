//! UI control plane: command protocol, the single control channel and
//! command dispatch

pub mod dispatch;
pub mod protocol;
pub mod session;

pub use dispatch::dispatch;
pub use protocol::{ClientCommand, ServerMessage};
pub use session::{ControlChannel, ControlSession};
