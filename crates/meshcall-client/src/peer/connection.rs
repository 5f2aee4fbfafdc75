use crate::media::{LocalTrack, MediaKind};
use anyhow::Result;
use async_trait::async_trait;
use meshcall_protocol::{IceCandidate, SessionDescription};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

/// Transport-level state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A track received from the remote side
#[derive(Clone)]
pub struct RemoteTrack {
    pub kind: MediaKind,
    pub id: String,
    pub stream_id: String,
    /// The live RTP track; absent for connections that carry no real media
    pub source: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

/// Things a connection reports on its own schedule
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    IceCandidate(IceCandidate),
    Track(RemoteTrack),
    StateChanged(ConnectionState),
}

/// Creates connections. Each connection reports into `events`.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Box<dyn PeerConnection>>;
}

/// One negotiated peer-to-peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Send `track` over this connection
    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    /// Reserve a receive-only media section for `kind`
    async fn add_recvonly(&self, kind: MediaKind) -> Result<()>;

    /// Create an offer and apply it as the local description
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    /// Create an answer and apply it as the local description
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Drop a local offer that has not been answered yet
    async fn rollback(&self) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
