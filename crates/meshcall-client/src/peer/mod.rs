//! The participant side of the mesh: one negotiated connection per remote
//! participant, driven by relay messages.

pub mod connection;
mod error;
mod link;
mod orchestrator;
pub mod rtc;

#[cfg(test)]
pub(crate) mod mock;

pub use connection::{ConnectionEvent, ConnectionState, PeerConnection, PeerConnector, RemoteTrack};
pub use error::NegotiationError;
pub use link::{IceRestartPolicy, NegotiationState};
pub use orchestrator::{CallEvent, PeerOrchestrator, RemoteStream};
pub use rtc::RtcConnector;
