//! Meshcall signaling protocol
//!
//! Wire types exchanged between participants and the relay. Every websocket
//! text frame carries exactly one event encoded as
//! `{"event": <name>, "data": <payload>}`.

pub mod messages;
pub mod types;

pub use messages::{ClientMessage, RawClientMessage, RawServerMessage, ServerMessage};
pub use types::*;
