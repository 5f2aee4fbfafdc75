use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{IceCandidate, ParticipantId, SessionDescription};

/// Events sent from a participant to the relay.
///
/// `D` is the session description payload and `C` the ICE candidate
/// payload. Participants use the typed defaults; the relay reads
/// [`RawClientMessage`] so it can forward payloads byte for byte in meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientMessage<D = SessionDescription, C = IceCandidate> {
    /// Join (or create) a room
    JoinRoom(String),

    /// Leave the current room
    LeaveRoom,

    /// Offer routed to `to`
    Offer { to: ParticipantId, offer: D },

    /// Answer routed to `to`
    Answer { to: ParticipantId, answer: D },

    /// ICE candidate routed to `to`
    IceCandidate { to: ParticipantId, candidate: C },

    /// Ping to keep connection alive
    Ping,
}

/// Events sent from the relay to a participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerMessage<D = SessionDescription, C = IceCandidate> {
    /// First frame on every connection: the session id the relay assigned
    Connected(ParticipantId),

    /// Someone joined a room this participant is in
    UserJoined(ParticipantId),

    /// Someone left (or disconnected from) a room this participant is in
    UserLeft(ParticipantId),

    /// Reply to a join: the other members of the room
    RoomUsers(Vec<ParticipantId>),

    Offer { from: ParticipantId, offer: D },

    Answer { from: ParticipantId, answer: D },

    IceCandidate { from: ParticipantId, candidate: C },

    /// Pong response to ping
    Pong,
}

/// Participant event with negotiation payloads left as unparsed JSON
pub type RawClientMessage = ClientMessage<Value, Value>;

/// Relay event with negotiation payloads left as unparsed JSON
pub type RawServerMessage = ServerMessage<Value, Value>;

impl<D, C> ClientMessage<D, C> {
    /// The routed form of a negotiation message, stamped with its sender.
    /// `None` for events the relay does not forward.
    pub fn into_routed(self, from: ParticipantId) -> Option<(ParticipantId, ServerMessage<D, C>)> {
        match self {
            ClientMessage::Offer { to, offer } => Some((to, ServerMessage::Offer { from, offer })),
            ClientMessage::Answer { to, answer } => {
                Some((to, ServerMessage::Answer { from, answer }))
            }
            ClientMessage::IceCandidate { to, candidate } => {
                Some((to, ServerMessage::IceCandidate { from, candidate }))
            }
            _ => None,
        }
    }
}
