use meshcall_protocol::ParticipantId;

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("no connection to {0}")]
    NoConnection(ParticipantId),

    #[error("answer from {0} while no offer is outstanding")]
    UnexpectedAnswer(ParticipantId),

    #[error("signaling channel closed")]
    SignalingClosed,

    #[error(transparent)]
    Connection(#[from] anyhow::Error),
}
