//! Mesh Panel Network Layer
//!
//! The control channel between the panel and its local nodes:
//! - Frame codec with an optional encrypted envelope
//! - Session registry correlating commands with responses

pub mod error;
pub mod protocol;
pub mod session;

pub use error::{NetworkError, NetworkResult};
pub use protocol::{
    commands, open_report, ControlCommand, ControlResponse, Envelope, InboundFrame, TcpPingRequest,
};
pub use session::{NodeCommander, SessionRegistry};
