//! Meshcall participant library
//!
//! Local media bootstrap, the relay connection and the peer orchestrator
//! that keeps one WebRTC connection per remote participant.

pub mod call;
pub mod media;
pub mod network;
pub mod peer;
pub mod state;
