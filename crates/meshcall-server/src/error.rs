use thiserror::Error;

/// Reasons an inbound relay frame is dropped.
///
/// None of these end the connection; the handler logs them and keeps reading.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Room id must not be empty")]
    EmptyRoomId,

    #[error("Unknown connection: {0}")]
    UnknownConnection(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
